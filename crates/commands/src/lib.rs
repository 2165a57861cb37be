//! Corral commands: list, describe, delete and xargs built generically over a
//! [`Descriptor`], so every kind gets the same surface without per-kind code.

#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{ArgMatches, Command};
use corral_client::DynamicClient;
use corral_core::{Descriptor, Error, Gateway, NamespaceLister, Result};
use tokio_util::sync::CancellationToken;

pub mod delete;
pub mod describe;
pub mod executor;
pub mod list;
pub mod output;
pub mod xargs;

pub use delete::DeleteByNameCommand;
pub use describe::DescribeCommand;
pub use executor::{CommandTemplate, Concurrency, Executor, PreviewRunner, ProcessRunner, Runner, Task};
pub use list::{ArgumentFilter, ListCommand};
pub use output::OutputFormat;
pub use xargs::XargsCommand;

/// Output sink shared between concurrently running tasks.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

pub fn write_to(w: &SharedWriter, text: &str) -> Result<()> {
    let mut guard = w.lock().unwrap_or_else(PoisonError::into_inner);
    guard.write_all(text.as_bytes())?;
    guard.flush()?;
    Ok(())
}

/// Process-wide settings resolved from global flags.
#[derive(Debug, Clone)]
pub struct Params {
    /// Target namespace; may be a comma-separated list for bulk commands.
    pub namespace: Option<String>,
    pub poll_interval: Duration,
}

impl Default for Params {
    fn default() -> Self {
        Self { namespace: None, poll_interval: Duration::from_secs(1) }
    }
}

/// Everything a command needs at run time.
#[derive(Clone)]
pub struct Context {
    pub gateway: Arc<dyn Gateway>,
    pub namespaces: Arc<dyn NamespaceLister>,
    pub params: Params,
    pub out: SharedWriter,
    pub err: SharedWriter,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn client(&self, descriptor: &Descriptor) -> DynamicClient {
        DynamicClient::with_descriptor(Arc::clone(&self.gateway), descriptor.clone())
    }

    pub fn validate_namespace_targeted(&self) -> Result<&str> {
        match self.params.namespace.as_deref() {
            Some(ns) if !ns.trim().is_empty() => Ok(ns),
            _ => Err(Error::Configuration(
                "no namespace targeted, use '--namespace NAMESPACE' or CORRAL_NAMESPACE to target a namespace".into(),
            )),
        }
    }

    /// Namespace for single-object commands; `None` for cluster-scoped kinds.
    pub fn scope_for(&self, descriptor: &Descriptor) -> Result<Option<&str>> {
        if descriptor.namespaced {
            self.validate_namespace_targeted().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn print(&self, text: &str) -> Result<()> {
        write_to(&self.out, text)
    }

    /// Human status line on the error stream.
    pub fn narrate(&self, line: &str) -> Result<()> {
        write_to(&self.err, &format!("{line}\n"))
    }
}

/// Help and naming knobs every generated command accepts.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub name: Option<String>,
    pub aliases: Vec<String>,
    pub short: Option<String>,
    pub long: Option<String>,
    pub example: Option<String>,
    pub plural_name: Option<String>,
}

impl CommandOptions {
    pub(crate) fn plural(&self, d: &Descriptor) -> String {
        self.plural_name.clone().unwrap_or_else(|| d.plural_friendly_name())
    }

    pub(crate) fn apply(&self, name: String, short: String, long: String) -> Command {
        let name = self.name.clone().unwrap_or(name);
        let example = self.example.clone().unwrap_or_else(|| format!("corral {name}"));
        Command::new(name)
            .visible_aliases(self.aliases.clone())
            .about(self.short.clone().unwrap_or(short))
            .long_about(self.long.clone().unwrap_or(long))
            .after_help(format!("Example:\n  {example}"))
    }
}

/// Builder setters shared by all command builders.
macro_rules! command_options {
    ($ty:ty) => {
        impl $ty {
            pub fn name(mut self, name: impl Into<String>) -> Self {
                self.options.name = Some(name.into());
                self
            }

            pub fn aliases<I, S>(mut self, aliases: I) -> Self
            where
                I: IntoIterator<Item = S>,
                S: Into<String>,
            {
                self.options.aliases = aliases.into_iter().map(Into::into).collect();
                self
            }

            pub fn short(mut self, short: impl Into<String>) -> Self {
                self.options.short = Some(short.into());
                self
            }

            pub fn long(mut self, long: impl Into<String>) -> Self {
                self.options.long = Some(long.into());
                self
            }

            pub fn example(mut self, example: impl Into<String>) -> Self {
                self.options.example = Some(example.into());
                self
            }

            pub fn plural_name(mut self, plural: impl Into<String>) -> Self {
                self.options.plural_name = Some(plural.into());
                self
            }
        }
    };
}
pub(crate) use command_options;

/// A generated subcommand: its clap definition plus how to run it.
#[async_trait::async_trait]
pub trait KindCommand: Send + Sync {
    fn command(&self) -> Command;

    async fn run(&self, ctx: &Context, matches: &ArgMatches) -> Result<()>;
}

/// The four standard commands for one kind.
pub fn commands_for(descriptor: &Descriptor) -> Vec<Box<dyn KindCommand>> {
    vec![
        Box::new(ListCommand::new(descriptor.clone())),
        Box::new(DescribeCommand::new(descriptor.clone())),
        Box::new(DeleteByNameCommand::new(descriptor.clone())),
        Box::new(XargsCommand::new(descriptor.clone())),
    ]
}
