use clap::{Arg, ArgMatches, Command};
use corral_core::{Descriptor, Result};

use crate::output::{format_one, OutputFormat};
use crate::{CommandOptions, Context, KindCommand};

/// `describe-<kind> NAME`: fetch one object and print it.
pub struct DescribeCommand {
    descriptor: Descriptor,
    options: CommandOptions,
}

crate::command_options!(DescribeCommand);

impl DescribeCommand {
    pub fn new(descriptor: Descriptor) -> Self {
        Self { descriptor, options: CommandOptions::default() }
    }
}

#[async_trait::async_trait]
impl KindCommand for DescribeCommand {
    fn command(&self) -> Command {
        let friendly = &self.descriptor.friendly_name;
        self.options
            .apply(
                format!("describe-{}", friendly.to_lowercase()),
                format!("Print information about the given {friendly}"),
                format!("Print information about the given {friendly}, including its conditions and spec."),
            )
            .arg(Arg::new("name").value_name("NAME").required(true))
            .arg(OutputFormat::arg())
    }

    async fn run(&self, ctx: &Context, m: &ArgMatches) -> Result<()> {
        let format = OutputFormat::from_matches(m);
        let name = m.get_one::<String>("name").map(String::as_str).unwrap_or_default();
        let ns = ctx.scope_for(&self.descriptor)?;
        if !format.is_structured() {
            let friendly = &self.descriptor.friendly_name;
            match ns {
                Some(ns) => ctx.narrate(&format!("Getting {friendly} {name} in namespace: {ns}"))?,
                None => ctx.narrate(&format!("Getting {friendly} {name}"))?,
            }
        }
        let obj = ctx.client(&self.descriptor).get(ns, name).await?;
        ctx.print(&format_one(&self.descriptor, &obj, format)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::context;
    use corral_core::{Error, Instance};
    use corral_store::MemoryStore;

    const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");
    const NAMESPACES: Descriptor = Descriptor::new("", "v1", "Namespace", "namespaces", false, "Namespace");

    #[tokio::test]
    async fn prints_one_object() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&APPS, Some("prod"), &Instance::new(&APPS, Some("prod"), "web")).unwrap();
        let cmd = DescribeCommand::new(APPS);
        let m = cmd.command().try_get_matches_from(["describe-app", "web"]).unwrap();
        let (ctx, out, err) = context(store, Some("prod"));
        cmd.run(&ctx, &m).await.unwrap();
        assert_eq!(err.text(), "Getting App web in namespace: prod\n");
        assert!(out.text().starts_with("Name:"));
        assert!(out.text().contains("Namespace:    prod\n"));
    }

    #[tokio::test]
    async fn structured_output_is_quiet() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&NAMESPACES, None, &Instance::new(&NAMESPACES, None, "prod")).unwrap();
        let cmd = DescribeCommand::new(NAMESPACES);
        let m = cmd.command().try_get_matches_from(["describe-namespace", "prod", "-o", "json"]).unwrap();
        let (ctx, out, err) = context(store, None);
        cmd.run(&ctx, &m).await.unwrap();
        assert_eq!(err.text(), "");
        let v: serde_json::Value = serde_json::from_str(&out.text()).unwrap();
        assert_eq!(v["metadata"]["name"], "prod");
    }

    #[tokio::test]
    async fn missing_namespace_is_a_configuration_error() {
        let store = Arc::new(MemoryStore::new());
        let cmd = DescribeCommand::new(APPS);
        let m = cmd.command().try_get_matches_from(["describe-app", "web"]).unwrap();
        let (ctx, _, _) = context(store, None);
        let err = cmd.run(&ctx, &m).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let cmd = DescribeCommand::new(APPS).name("show-app");
        let m = cmd.command().try_get_matches_from(["show-app", "ghost"]).unwrap();
        let (ctx, _, _) = context(store, Some("prod"));
        assert!(cmd.run(&ctx, &m).await.unwrap_err().is_not_found());
    }
}
