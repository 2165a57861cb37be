use clap::{Arg, ArgAction, ArgMatches, Command};
use corral_core::{Descriptor, Error, PropagationPolicy, Result};
use tracing::info;

use crate::{CommandOptions, Context, KindCommand};

/// `delete-<kind> NAME`: delete and, unless `--async`, wait until it is gone.
pub struct DeleteByNameCommand {
    descriptor: Descriptor,
    options: CommandOptions,
    policy: PropagationPolicy,
}

crate::command_options!(DeleteByNameCommand);

impl DeleteByNameCommand {
    pub fn new(descriptor: Descriptor) -> Self {
        Self { descriptor, options: CommandOptions::default(), policy: PropagationPolicy::default() }
    }

    pub fn propagation_policy(mut self, policy: PropagationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait::async_trait]
impl KindCommand for DeleteByNameCommand {
    fn command(&self) -> Command {
        let friendly = &self.descriptor.friendly_name;
        self.options
            .apply(
                format!("delete-{}", friendly.to_lowercase()),
                format!("Delete a {friendly}"),
                format!("Delete a {friendly} by name and wait for its dependents to be cleaned up."),
            )
            .arg(Arg::new("name").value_name("NAME").required(true))
            .arg(
                Arg::new("async")
                    .long("async")
                    .action(ArgAction::SetTrue)
                    .help("Don't wait for the delete to complete"),
            )
    }

    async fn run(&self, ctx: &Context, m: &ArgMatches) -> Result<()> {
        let name = m.get_one::<String>("name").map(String::as_str).unwrap_or_default();
        let ns = ctx.scope_for(&self.descriptor)?;
        let friendly = &self.descriptor.friendly_name;
        let client = ctx.client(&self.descriptor);

        match ns {
            Some(ns) => ctx.narrate(&format!("Deleting {friendly} {name:?} in namespace {ns:?}"))?,
            None => ctx.narrate(&format!("Deleting {friendly} {name:?}"))?,
        }
        info!(kind = %self.descriptor.kind, name, ns = ?ns, policy = ?self.policy, "delete");
        client.delete(ns, name, self.policy).await.map_err(|e| Error::Delete {
            kind: friendly.to_string(),
            name: name.to_string(),
            source: Box::new(e),
        })?;

        if !m.get_flag("async") {
            ctx.narrate("Waiting for deletion...")?;
            client
                .wait_for_deletion(ns, name, ctx.params.poll_interval, &ctx.cancel)
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        Error::Timeout("timed out while waiting for resource to delete".into())
                    } else {
                        Error::Gateway(format!("waiting for deletion failed: {e}"))
                    }
                })?;
        }
        ctx.narrate(&format!("Deleted {friendly} {name:?}"))
    }
}
