//! `<plural> [ARGS...]`: one List call filtered by labels and positional arguments.

use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use corral_core::{Descriptor, Error, ListOptions, Requirement, Result, Selector};
use tracing::info;

use crate::output::{format_list, OutputFormat};
use crate::{CommandOptions, Context, KindCommand};

type FilterFn = dyn Fn(&str, &mut ListOptions) -> Result<()> + Send + Sync;

/// A named positional argument whose value narrows the list.
#[derive(Clone)]
pub struct ArgumentFilter {
    pub name: String,
    pub required: bool,
    pub handler: Arc<FilterFn>,
}

impl ArgumentFilter {
    pub fn new(
        name: impl Into<String>,
        required: bool,
        handler: impl Fn(&str, &mut ListOptions) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), required, handler: Arc::new(handler) }
    }

    /// Bind the argument's value as an equality match on `label`.
    pub fn label(name: impl Into<String>, label: impl Into<String>, required: bool) -> Self {
        let label = label.into();
        Self::new(name, required, move |value, opts| {
            let req = Requirement::equals(label.clone(), value)?;
            opts.label_selector = std::mem::take(&mut opts.label_selector).add(req);
            Ok(())
        })
    }
}

/// Usage string and (required, max) counts for a set of argument filters.
fn arg_shape(filters: &[ArgumentFilter]) -> (String, usize, usize) {
    let mut usage = String::new();
    let mut required = 0;
    for f in filters.iter().rev() {
        usage = format!("{} {}", f.name, usage).trim().to_string();
        if f.required {
            required += 1;
        } else {
            usage = format!("[{usage}]");
        }
    }
    (usage, required, filters.len())
}

fn check_arg_count(got: usize, required: usize, max: usize) -> Result<()> {
    if got >= required && got <= max {
        return Ok(());
    }
    if required == max {
        Err(Error::Validation(format!("accepts {max} arg(s), received {got}")))
    } else {
        Err(Error::Validation(format!("accepts between {required} and {max} arg(s), received {got}")))
    }
}

/// Flag-bound label filters, shared with xargs.
pub(crate) fn label_filter_args(filters: &[(String, String)]) -> Vec<Arg> {
    filters
        .iter()
        .map(|(flag, label)| {
            Arg::new(flag.clone())
                .long(flag.clone())
                .value_name("VALUE")
                .help(format!("Sets a filter for the {label:?} label."))
        })
        .collect()
}

pub(crate) fn label_selector(
    static_reqs: &[Requirement],
    filters: &[(String, String)],
    m: &ArgMatches,
) -> Result<Selector> {
    let mut sel = Selector::everything().extend(static_reqs.iter().cloned());
    for (flag, label) in filters {
        if let Some(v) = m.get_one::<String>(flag).filter(|v| !v.is_empty()) {
            sel = sel.add(Requirement::equals(label.clone(), v.clone())?);
        }
    }
    Ok(sel)
}

pub struct ListCommand {
    descriptor: Descriptor,
    options: CommandOptions,
    label_requirements: Vec<Requirement>,
    label_filters: Vec<(String, String)>,
    argument_filters: Vec<ArgumentFilter>,
}

crate::command_options!(ListCommand);

impl ListCommand {
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            options: CommandOptions::default(),
            label_requirements: Vec::new(),
            label_filters: Vec::new(),
            argument_filters: Vec::new(),
        }
    }

    /// Requirement applied to every list, e.g. `managed-by=corral`.
    pub fn label_requirement(mut self, req: Requirement) -> Self {
        self.label_requirements.push(req);
        self
    }

    /// Expose `--<flag> VALUE` filtering on `label`.
    pub fn label_filter(mut self, flag: impl Into<String>, label: impl Into<String>) -> Self {
        self.label_filters.push((flag.into(), label.into()));
        self
    }

    pub fn argument_filter(mut self, filter: ArgumentFilter) -> Self {
        self.argument_filters.push(filter);
        self
    }

    fn list_options(&self, m: &ArgMatches) -> Result<ListOptions> {
        let args: Vec<&String> = m.get_many::<String>("args").map(Iterator::collect).unwrap_or_default();
        let (_, required, max) = arg_shape(&self.argument_filters);
        check_arg_count(args.len(), required, max)?;

        let mut opts =
            ListOptions::default().labels(label_selector(&self.label_requirements, &self.label_filters, m)?);
        for (i, (filter, value)) in self.argument_filters.iter().zip(args).enumerate() {
            (filter.handler)(value, &mut opts)
                .map_err(|e| Error::Validation(format!("couldn't parse argument {} value: {value:?}: {e}", i + 1)))?;
        }
        Ok(opts)
    }
}

#[async_trait::async_trait]
impl KindCommand for ListCommand {
    fn command(&self) -> Command {
        let plural = self.options.plural(&self.descriptor);
        let scope = if self.descriptor.namespaced { "in the targeted namespace" } else { "in the cluster" };
        let (usage, _, _) = arg_shape(&self.argument_filters);
        let mut cmd = self.options.apply(
            plural.to_lowercase(),
            format!("List {plural} {scope}"),
            format!("List {plural} {scope}, optionally filtered by labels."),
        );
        cmd = cmd.arg(OutputFormat::arg()).args(label_filter_args(&self.label_filters));
        let mut args = Arg::new("args").num_args(0..).action(ArgAction::Append);
        if !usage.is_empty() {
            args = args.value_name(usage);
        } else {
            args = args.hide(true);
        }
        cmd.arg(args)
    }

    async fn run(&self, ctx: &Context, m: &ArgMatches) -> Result<()> {
        let format = OutputFormat::from_matches(m);
        let opts = self.list_options(m)?;
        let ns = ctx.scope_for(&self.descriptor)?;
        let plural = self.options.plural(&self.descriptor);
        if !format.is_structured() {
            match ns {
                Some(ns) => ctx.narrate(&format!("Listing {plural} in namespace: {ns}"))?,
                None => ctx.narrate(&format!("Listing {plural}"))?,
            }
        }
        info!(kind = %self.descriptor.kind, ns = ?ns, selector = %opts.label_selector, "list");
        let items = ctx.client(&self.descriptor).list(ns, &opts).await?;
        ctx.print(&format_list(&self.descriptor, &items, format)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use corral_core::Instance;
    use corral_store::MemoryStore;

    const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");

    #[test]
    fn usage_and_counts_follow_filters() {
        let filters = vec![
            ArgumentFilter::label("OWNER", "owner", true),
            ArgumentFilter::label("TIER", "tier", false),
        ];
        assert_eq!(arg_shape(&filters), ("OWNER [TIER]".to_string(), 1, 2));
        assert_eq!(arg_shape(&[]), (String::new(), 0, 0));
    }

    #[test]
    fn count_errors_match_cli_conventions() {
        assert_eq!(check_arg_count(2, 1, 1).unwrap_err().to_string(), "validation: accepts 1 arg(s), received 2");
        assert_eq!(
            check_arg_count(0, 1, 2).unwrap_err().to_string(),
            "validation: accepts between 1 and 2 arg(s), received 0"
        );
        assert!(check_arg_count(1, 1, 2).is_ok());
    }

    #[tokio::test]
    async fn label_flags_and_static_requirements_combine() {
        let store = Arc::new(MemoryStore::new());
        for (name, tier, managed) in [("a", "web", true), ("b", "db", true), ("c", "web", false)] {
            let mut obj = Instance::new(&APPS, Some("ns"), name).with_label("tier", tier);
            if managed {
                obj = obj.with_label("managed-by", "corral");
            }
            store.insert(&APPS, Some("ns"), &obj).unwrap();
        }
        let cmd = ListCommand::new(APPS)
            .label_requirement(Requirement::equals("managed-by", "corral").unwrap())
            .label_filter("tier", "tier");
        let m = cmd.command().try_get_matches_from(["apps", "--tier", "web", "-o", "name"]).unwrap();
        let (ctx, out, err) = context(store, Some("ns"));
        cmd.run(&ctx, &m).await.unwrap();
        assert_eq!(out.text(), "deployments.apps/a\n");
        assert_eq!(err.text(), "");
    }

    #[tokio::test]
    async fn namespaced_list_requires_target() {
        let store = Arc::new(MemoryStore::new());
        let cmd = ListCommand::new(APPS);
        let m = cmd.command().try_get_matches_from(["apps"]).unwrap();
        let (ctx, _, _) = context(store, None);
        assert!(matches!(cmd.run(&ctx, &m).await.unwrap_err(), Error::Configuration(_)));
    }

    #[tokio::test]
    async fn bad_argument_values_name_the_position() {
        let store = Arc::new(MemoryStore::new());
        let cmd = ListCommand::new(APPS).argument_filter(ArgumentFilter::label("OWNER", "owner", true));
        let m = cmd.command().try_get_matches_from(["apps", "not valid"]).unwrap();
        let (ctx, _, _) = context(store, Some("ns"));
        let err = cmd.run(&ctx, &m).await.unwrap_err().to_string();
        assert!(err.starts_with("validation: couldn't parse argument 1 value: \"not valid\": "), "{err}");
    }
}
