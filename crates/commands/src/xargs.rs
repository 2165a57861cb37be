use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use corral_core::{Descriptor, Error, ListOptions, Requirement, Result};
use tracing::info;

use crate::executor::{CommandTemplate, Concurrency, Executor, PreviewRunner, ProcessRunner, Runner};
use crate::list::{label_filter_args, label_selector};
use crate::{CommandOptions, Context, KindCommand};

/// `xargs-<plural> TEMPLATE...`: run a command once per matching object.
///
/// Dry runs print the commands as a shell script on stdout and run them
/// one at a time so the output order is stable.
pub struct XargsCommand {
    descriptor: Descriptor,
    options: CommandOptions,
    label_requirements: Vec<Requirement>,
    label_filters: Vec<(String, String)>,
}

crate::command_options!(XargsCommand);

impl XargsCommand {
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            options: CommandOptions::default(),
            label_requirements: Vec::new(),
            label_filters: Vec::new(),
        }
    }

    pub fn label_requirement(mut self, req: Requirement) -> Self {
        self.label_requirements.push(req);
        self
    }

    pub fn label_filter(mut self, flag: impl Into<String>, label: impl Into<String>) -> Self {
        self.label_filters.push((flag.into(), label.into()));
        self
    }

    async fn targets(&self, ctx: &Context, m: &ArgMatches) -> Result<Vec<Option<String>>> {
        if !self.descriptor.namespaced {
            return Ok(vec![None]);
        }
        let names: Vec<String> = if m.get_flag("all-namespaces") {
            ctx.namespaces.list_namespaces().await?
        } else if let Some(list) = m.get_many::<String>("namespaces") {
            list.cloned().collect()
        } else {
            ctx.validate_namespace_targeted()?.split(',').map(str::to_string).collect()
        };
        let names: Vec<Option<String>> =
            names.into_iter().map(|n| n.trim().to_string()).filter(|n| !n.is_empty()).map(Some).collect();
        if names.is_empty() {
            return Err(Error::Configuration("no namespaces matched".into()));
        }
        Ok(names)
    }
}

fn concurrency_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_name("N")
        .value_parser(value_parser!(Concurrency))
        .default_value("1")
        .allow_negative_numbers(true)
        .help(help)
}

#[async_trait::async_trait]
impl KindCommand for XargsCommand {
    fn command(&self) -> Command {
        let plural = self.options.plural(&self.descriptor);
        let mut cmd = self
            .options
            .apply(
                format!("xargs-{}", plural.to_lowercase()),
                format!("Run a command for every {}", self.descriptor.friendly_name),
                format!(
                    "Run a command for every {}. Each TEMPLATE token is rendered with .Name, .Namespace and .Kind \
                     before the command is run.",
                    self.descriptor.friendly_name
                ),
            )
            .arg(
                Arg::new("dry-run")
                    .long("dry-run")
                    .value_name("BOOL")
                    .value_parser(value_parser!(bool))
                    .num_args(0..=1)
                    .require_equals(true)
                    .default_value("true")
                    .default_missing_value("true")
                    .help("Print the commands instead of running them"),
            )
            .arg(concurrency_arg("resource-concurrency", "Commands to run at once per namespace, -1 for unbounded"))
            .args(label_filter_args(&self.label_filters));
        if self.descriptor.namespaced {
            cmd = cmd
                .arg(
                    Arg::new("all-namespaces")
                        .long("all-namespaces")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("namespaces")
                        .help("Run against every namespace"),
                )
                .arg(
                    Arg::new("namespaces")
                        .long("namespaces")
                        .value_name("NAMESPACES")
                        .value_delimiter(',')
                        .action(ArgAction::Append)
                        .help("Comma separated namespaces to run against"),
                )
                .arg(concurrency_arg("namespace-concurrency", "Namespaces to process at once, -1 for unbounded"));
        }
        cmd.arg(
            Arg::new("template")
                .value_name("TEMPLATE")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true),
        )
    }

    async fn run(&self, ctx: &Context, m: &ArgMatches) -> Result<()> {
        let tokens: Vec<String> = m.get_many::<String>("template").map(|v| v.cloned().collect()).unwrap_or_default();
        let template = CommandTemplate::parse(tokens)?;
        let dry_run = m.get_one::<bool>("dry-run").copied().unwrap_or(true);
        let opts = ListOptions::default().labels(label_selector(&self.label_requirements, &self.label_filters, m)?);
        let targets = self.targets(ctx, m).await?;

        let plural = self.options.plural(&self.descriptor);
        if self.descriptor.namespaced {
            if m.get_flag("all-namespaces") {
                ctx.print(&format!("# Xargs {plural} in all namespaces\n"))?;
            } else {
                let list: Vec<&str> = targets.iter().flatten().map(String::as_str).collect();
                ctx.print(&format!("# Xargs {plural} in namespace: {}\n", list.join(",")))?;
            }
        }

        let bound = |name: &str| m.try_get_one::<Concurrency>(name).ok().flatten().copied().unwrap_or_default();
        let (namespace_bound, resource_bound) = if dry_run {
            (Concurrency::default(), Concurrency::default())
        } else {
            (bound("namespace-concurrency"), bound("resource-concurrency"))
        };
        let runner: Arc<dyn Runner> = if dry_run {
            Arc::new(PreviewRunner::new(ctx.out.clone()))
        } else {
            Arc::new(ProcessRunner::new(ctx.out.clone(), ctx.err.clone()))
        };
        info!(kind = %self.descriptor.kind, dry_run, targets = targets.len(), "xargs");

        Executor::new(ctx.client(&self.descriptor), runner, template)
            .list_options(opts)
            .namespace_concurrency(namespace_bound)
            .resource_concurrency(resource_bound)
            .run(targets, &ctx.cancel)
            .await?;

        if dry_run {
            ctx.print("# Run with --dry-run=false to apply.\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use corral_core::Instance;
    use corral_store::MemoryStore;

    const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");
    const NAMESPACES: Descriptor = Descriptor::new("", "v1", "Namespace", "namespaces", false, "Namespace");

    fn store_with(ns_objects: &[(&str, &str)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for &(ns, name) in ns_objects {
            store.insert(&APPS, Some(ns), &Instance::new(&APPS, Some(ns), name)).unwrap();
        }
        store
    }

    async fn run(cmd: &XargsCommand, store: Arc<MemoryStore>, ns: Option<&str>, args: &[&str]) -> Result<String> {
        let m = cmd.command().try_get_matches_from(args.iter().copied()).unwrap();
        let (ctx, out, _) = context(store, ns);
        cmd.run(&ctx, &m).await?;
        Ok(out.text())
    }

    #[tokio::test]
    async fn dry_run_prints_a_script() {
        let store = store_with(&[("my-ns", "some-object-name")]);
        let cmd = XargsCommand::new(APPS);
        let out = run(&cmd, store, Some("my-ns"), &["xargs-apps", "{{.Namespace}} {{.Name}}"]).await.unwrap();
        assert_eq!(
            out,
            "# Xargs Apps in namespace: my-ns\n\
             # Command for namespace=my-ns App=some-object-name\n\
             'my-ns some-object-name'\n\
             # Run with --dry-run=false to apply.\n"
        );
    }

    #[tokio::test]
    async fn dry_run_output_is_stable_across_namespaces() {
        let objects = [("a", "one"), ("a", "two"), ("b", "one"), ("c", "three"), ("c", "four")];
        let cmd = XargsCommand::new(APPS);
        let args = [
            "xargs-apps",
            "--namespaces",
            "a,b,c",
            "--namespace-concurrency=-1",
            "--resource-concurrency=-1",
            "echo",
            "{{.Namespace}}/{{.Name}}",
        ];
        let first = run(&cmd, store_with(&objects), None, &args).await.unwrap();
        let second = run(&cmd, store_with(&objects), None, &args).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            "# Xargs Apps in namespace: a,b,c\n\
             # Command for namespace=a App=one\necho a/one\n\
             # Command for namespace=a App=two\necho a/two\n\
             # Command for namespace=b App=one\necho b/one\n\
             # Command for namespace=c App=four\necho c/four\n\
             # Command for namespace=c App=three\necho c/three\n\
             # Run with --dry-run=false to apply.\n"
        );
    }

    #[tokio::test]
    async fn comma_separated_namespace_targets_several() {
        let store = store_with(&[("x", "web"), ("y", "web")]);
        let cmd = XargsCommand::new(APPS);
        let out = run(&cmd, store, Some("x,y"), &["xargs-apps", "echo", "{{.Name}}"]).await.unwrap();
        assert!(out.starts_with("# Xargs Apps in namespace: x,y\n"));
        assert_eq!(out.matches("# Command for").count(), 2);
    }

    #[tokio::test]
    async fn cluster_kinds_skip_the_namespace_line() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&NAMESPACES, None, &Instance::new(&NAMESPACES, None, "some-object-name")).unwrap();
        let cmd = XargsCommand::new(NAMESPACES);
        let out = run(&cmd, store, None, &["xargs-namespaces", "{{.Namespace}} {{.Name}}"]).await.unwrap();
        assert_eq!(
            out,
            "# Command for Namespace=some-object-name\n' some-object-name'\n# Run with --dry-run=false to apply.\n"
        );
    }

    #[tokio::test]
    async fn all_namespaces_lists_known_namespaces() {
        let store = store_with(&[("a", "web"), ("b", "api")]);
        let cmd = XargsCommand::new(APPS);
        let out = run(&cmd, store, None, &["xargs-apps", "--all-namespaces", "echo", "{{.Name}}"]).await.unwrap();
        assert!(out.starts_with("# Xargs Apps in all namespaces\n"));
        assert!(out.contains("echo web\n") && out.contains("echo api\n"));
    }

    #[tokio::test]
    async fn template_is_required() {
        let cmd = XargsCommand::new(APPS);
        let err = run(&cmd, store_with(&[]), Some("a"), &["xargs-apps"]).await.unwrap_err();
        assert_eq!(err.to_string(), "validation: requires at least 1 arg(s), only received 0");
    }

    #[tokio::test]
    async fn namespace_must_be_targeted() {
        let cmd = XargsCommand::new(APPS);
        let err = run(&cmd, store_with(&[]), None, &["xargs-apps", "echo"]).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn apply_runs_commands() {
        let store = store_with(&[("prod", "web")]);
        let cmd = XargsCommand::new(APPS);
        let out = run(&cmd, store, Some("prod"), &["xargs-apps", "--dry-run=false", "echo", "hello {{.Name}}"])
            .await
            .unwrap();
        assert_eq!(out, "# Xargs Apps in namespace: prod\n[namespace=prod App=web] hello web\n");
    }
}
