//! Bulk execution: list targets per namespace, render one command per object
//! and run it under two levels of bounded concurrency.
//!
//! The first failing task stops further dispatch. Tasks already started run
//! to completion unless the caller's token is cancelled.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use corral_client::DynamicClient;
use corral_core::{Error, Instance, ListOptions, Result};
use futures::StreamExt;
use metrics::counter;
use tokio::io::AsyncRead;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{write_to, SharedWriter};

/// How many tasks of one level may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Unbounded,
    Limited(NonZeroUsize),
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::Limited(NonZeroUsize::MIN)
    }
}

impl Concurrency {
    pub fn semaphore(self) -> Option<Arc<Semaphore>> {
        match self {
            Self::Unbounded => None,
            Self::Limited(n) => Some(Arc::new(Semaphore::new(n.get()))),
        }
    }
}

impl FromStr for Concurrency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unbounded") || s == "-1" {
            return Ok(Self::Unbounded);
        }
        s.parse::<NonZeroUsize>()
            .map(Self::Limited)
            .map_err(|_| Error::Validation(format!("concurrency must be a positive number or -1 for unbounded, got {s:?}")))
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::Limited(n) => write!(f, "{n}"),
        }
    }
}

/// Wait for a slot unless halted first. `None` means stop launching.
async fn slot(sem: Option<&Arc<Semaphore>>, halt: &CancellationToken) -> Option<Option<OwnedSemaphorePermit>> {
    let Some(sem) = sem else {
        return (!halt.is_cancelled()).then_some(None);
    };
    tokio::select! {
        biased;
        _ = halt.cancelled() => None,
        permit = Arc::clone(sem).acquire_owned() => permit.ok().map(Some),
    }
}

/// One rendered command bound to the object it was rendered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub namespace: Option<String>,
    pub name: String,
    /// Friendly kind name used in output labels.
    pub kind: String,
    pub argv: Vec<String>,
}

impl Task {
    fn label(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("namespace={ns} {}={}", self.kind, self.name),
            _ => format!("{}={}", self.kind, self.name),
        }
    }

    /// Prefix for every output line of this task.
    pub fn prefix(&self) -> String {
        format!("[{}] ", self.label())
    }

    pub fn header(&self) -> String {
        format!("# Command for {}", self.label())
    }

    /// The argv quoted for a POSIX shell.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|t| shell_escape::unix::escape(Cow::Borrowed(t.as_str())))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Executes a rendered task.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<()>;
}

/// Dry run: print each command as a shell script line instead of running it.
pub struct PreviewRunner {
    out: SharedWriter,
}

impl PreviewRunner {
    pub fn new(out: SharedWriter) -> Self {
        Self { out }
    }
}

#[async_trait::async_trait]
impl Runner for PreviewRunner {
    async fn run(&self, task: &Task, _cancel: &CancellationToken) -> Result<()> {
        write_to(&self.out, &format!("{}\n{}\n", task.header(), task.command_line()))
    }
}

/// Spawns argv directly and streams its output line by line with the task prefix.
pub struct ProcessRunner {
    out: SharedWriter,
    err: SharedWriter,
}

impl ProcessRunner {
    pub fn new(out: SharedWriter, err: SharedWriter) -> Self {
        Self { out, err }
    }
}

async fn pump_lines<R>(reader: Option<R>, sink: &SharedWriter, prefix: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return Ok(()) };
    let mut stream = ReaderStream::new(reader);
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            write_to(sink, &format!("{prefix}{}", String::from_utf8_lossy(&line)))?;
        }
    }
    if !buf.is_empty() {
        write_to(sink, &format!("{prefix}{}\n", String::from_utf8_lossy(&buf)))?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Runner for ProcessRunner {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<()> {
        let command = task.command_line();
        let Some((program, args)) = task.argv.split_first() else {
            return Err(Error::Template("command template rendered no tokens".into()));
        };
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Exec { command: command.clone(), reason: e.to_string() })?;
        let prefix = task.prefix();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, out_res, err_res) = tokio::select! {
            // the child is killed on drop
            _ = cancel.cancelled() => {
                return Err(Error::Timeout(format!("{prefix}cancelled")));
            }
            r = async {
                tokio::join!(
                    child.wait(),
                    pump_lines(stdout, &self.out, &prefix),
                    pump_lines(stderr, &self.err, &prefix),
                )
            } => r,
        };
        out_res?;
        err_res?;
        let status = status.map_err(|e| Error::Exec { command: command.clone(), reason: e.to_string() })?;
        if !status.success() {
            write_to(&self.err, &format!("{prefix}command failed: {status}\n"))?;
            return Err(Error::Exec { command, reason: status.to_string() });
        }
        Ok(())
    }
}

/// Argument tokens, each a text template over `.Name`, `.Namespace` and `.Kind`.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    tokens: Arc<[String]>,
}

fn compile(src: &str) -> Result<gtmpl::Template> {
    let mut tmpl = gtmpl::Template::default();
    tmpl.parse(src)
        .map_err(|e| Error::Template(format!("couldn't parse command template {src:?}: {e:?}")))?;
    Ok(tmpl)
}

impl CommandTemplate {
    pub fn parse<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(Error::Validation("requires at least 1 arg(s), only received 0".into()));
        }
        for t in &tokens {
            compile(t)?;
        }
        Ok(Self { tokens: tokens.into() })
    }

    pub fn render(&self, kind: &str, obj: &Instance) -> Result<Vec<String>> {
        let mut vars = HashMap::new();
        vars.insert("Name".to_string(), gtmpl::Value::String(obj.name().to_string()));
        vars.insert("Namespace".to_string(), gtmpl::Value::String(obj.namespace().unwrap_or_default().to_string()));
        vars.insert("Kind".to_string(), gtmpl::Value::String(kind.to_string()));
        let ctx = gtmpl::Context::from(gtmpl::Value::Map(vars));
        self.tokens
            .iter()
            .map(|src| {
                compile(src)?
                    .render(&ctx)
                    .map_err(|e| Error::Template(format!("couldn't render command template {src:?}: {e:?}")))
            })
            .collect()
    }
}

/// Shared halt state. `token` gates dispatch; `parent` is what running tasks watch.
struct Halt {
    token: CancellationToken,
    parent: CancellationToken,
    first: Mutex<Option<Error>>,
}

impl Halt {
    fn fail(&self, err: Error) {
        counter!("corral_xargs_failures_total", 1u64);
        let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() && !self.token.is_cancelled() {
            warn!(error = %err, "task failed, halting remaining work");
            *first = Some(err);
            self.token.cancel();
        } else {
            debug!(error = %err, "ignoring error after halt");
        }
    }

    fn take(&self) -> Option<Error> {
        self.first.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

async fn drain(set: &mut JoinSet<()>, halt: &Halt) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            halt.fail(Error::Internal(format!("task did not complete: {e}")));
        }
    }
}

/// Lists each target namespace and runs the template once per object.
#[derive(Clone)]
pub struct Executor {
    client: DynamicClient,
    runner: Arc<dyn Runner>,
    template: CommandTemplate,
    list_options: ListOptions,
    namespace_bound: Concurrency,
    resource_bound: Concurrency,
}

impl Executor {
    pub fn new(client: DynamicClient, runner: Arc<dyn Runner>, template: CommandTemplate) -> Self {
        Self {
            client,
            runner,
            template,
            list_options: ListOptions::default(),
            namespace_bound: Concurrency::default(),
            resource_bound: Concurrency::default(),
        }
    }

    pub fn list_options(mut self, opts: ListOptions) -> Self {
        self.list_options = opts;
        self
    }

    pub fn namespace_concurrency(mut self, bound: Concurrency) -> Self {
        self.namespace_bound = bound;
        self
    }

    /// Per-namespace bound; the overall ceiling is the product of both bounds.
    pub fn resource_concurrency(mut self, bound: Concurrency) -> Self {
        self.resource_bound = bound;
        self
    }

    /// Run over `targets`, where `None` stands for cluster scope.
    pub async fn run(&self, targets: Vec<Option<String>>, cancel: &CancellationToken) -> Result<()> {
        let halt = Arc::new(Halt { token: cancel.child_token(), parent: cancel.clone(), first: Mutex::new(None) });
        let slots = self.namespace_bound.semaphore();
        info!(
            kind = %self.client.descriptor().kind,
            namespaces = targets.len(),
            namespace_bound = %self.namespace_bound,
            resource_bound = %self.resource_bound,
            "xargs start"
        );

        let mut set = JoinSet::new();
        for ns in targets {
            let Some(permit) = slot(slots.as_ref(), &halt.token).await else { break };
            let this = self.clone();
            let halt = Arc::clone(&halt);
            set.spawn(async move {
                let _permit = permit;
                this.run_namespace(ns, &halt).await;
            });
        }
        drain(&mut set, &halt).await;

        if let Some(err) = halt.take() {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(Error::Timeout("cancelled before every command ran".into()));
        }
        Ok(())
    }

    async fn run_namespace(&self, ns: Option<String>, halt: &Arc<Halt>) {
        let items = match self.client.list(ns.as_deref(), &self.list_options).await {
            Ok(items) => items,
            Err(e) => return halt.fail(e),
        };
        debug!(ns = ?ns, count = items.len(), "targets listed");

        let slots = self.resource_bound.semaphore();
        let mut set = JoinSet::new();
        for obj in items {
            let Some(permit) = slot(slots.as_ref(), &halt.token).await else { break };
            let this = self.clone();
            let halt_ref = Arc::clone(halt);
            set.spawn(async move {
                let _permit = permit;
                if let Err(e) = this.run_resource(&obj, &halt_ref.parent).await {
                    halt_ref.fail(Error::ChildTask {
                        namespace: obj.namespace().map(str::to_string),
                        name: obj.name().to_string(),
                        source: Box::new(e),
                    });
                }
            });
        }
        drain(&mut set, halt).await;
    }

    async fn run_resource(&self, obj: &Instance, cancel: &CancellationToken) -> Result<()> {
        let kind = self.client.descriptor().friendly_name.to_string();
        let argv = self.template.render(&kind, obj)?;
        let task = Task {
            namespace: obj.namespace().map(str::to_string),
            name: obj.name().to_string(),
            kind,
            argv,
        };
        counter!("corral_xargs_tasks_total", 1u64);
        debug!(task = %task.label(), "running");
        self.runner.run(&task, cancel).await
    }
}
