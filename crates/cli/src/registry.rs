//! Kinds the binary knows about and the commands generated for them.

use corral_commands::{
    ArgumentFilter, DeleteByNameCommand, DescribeCommand, KindCommand, ListCommand, XargsCommand,
};
use corral_core::Descriptor;

pub const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");
pub const JOBS: Descriptor = Descriptor::new("batch", "v1", "Job", "jobs", true, "Job");
pub const PODS: Descriptor = Descriptor::new("", "v1", "Pod", "pods", true, "Pod");
pub const SERVICES: Descriptor = Descriptor::new("", "v1", "Service", "services", true, "Service");
pub const CONFIG_MAPS: Descriptor = Descriptor::new("", "v1", "ConfigMap", "configmaps", true, "ConfigMap");
pub const SECRETS: Descriptor = Descriptor::new("", "v1", "Secret", "secrets", true, "Secret");
pub const NAMESPACES: Descriptor = Descriptor::new("", "v1", "Namespace", "namespaces", false, "Namespace");

pub fn kinds() -> Vec<Descriptor> {
    vec![APPS, JOBS, PODS, SERVICES, CONFIG_MAPS, SECRETS, NAMESPACES]
}

pub fn find(api_version: &str, kind: &str) -> Option<Descriptor> {
    kinds().into_iter().find(|d| d.api_version() == api_version && d.kind == kind)
}

fn standard(d: &Descriptor, list: ListCommand, xargs: XargsCommand) -> Vec<Box<dyn KindCommand>> {
    vec![
        Box::new(list),
        Box::new(DescribeCommand::new(d.clone())),
        Box::new(DeleteByNameCommand::new(d.clone())),
        Box::new(xargs),
    ]
}

pub fn commands() -> Vec<Box<dyn KindCommand>> {
    let mut out = Vec::new();
    for d in kinds() {
        let mut list = ListCommand::new(d.clone());
        let mut xargs = XargsCommand::new(d.clone());
        match d.kind.as_ref() {
            "Deployment" => {
                list = list.label_filter("tier", "tier").example("corral apps --tier web");
                xargs = xargs
                    .label_filter("tier", "tier")
                    .example("corral xargs-apps --namespaces a,b -- kubectl rollout restart deployment/{{.Name}} -n {{.Namespace}}");
            }
            "Pod" => {
                list = list
                    .argument_filter(ArgumentFilter::label("JOB", "job-name", false))
                    .example("corral pods my-job");
                xargs = xargs.label_filter("job", "job-name");
            }
            "Namespace" => {
                list = list.aliases(["ns"]);
            }
            _ => {}
        }
        out.extend(standard(&d, list, xargs));
    }
    out
}
