//! Printers for list and single-object views.

use std::fmt::Write as _;

use clap::{value_parser, Arg, ArgMatches, ValueEnum};
use corral_client::READY;
use corral_core::{Descriptor, Error, Instance, Resource, Result};
use serde_json::json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
    Name,
}

impl OutputFormat {
    /// Machine-readable formats suppress narration.
    pub fn is_structured(self) -> bool {
        !matches!(self, Self::Table)
    }

    pub fn arg() -> Arg {
        Arg::new("output")
            .short('o')
            .long("output")
            .value_parser(value_parser!(OutputFormat))
            .default_value("table")
            .help("Output format")
    }

    pub fn from_matches(m: &ArgMatches) -> Self {
        m.get_one::<OutputFormat>("output").copied().unwrap_or_default()
    }
}

fn to_yaml<T: serde::Serialize + ?Sized>(v: &T) -> Result<String> {
    serde_yaml::to_string(v).map_err(|e| Error::Internal(format!("encoding yaml: {e}")))
}

fn render_age(creation: Option<&str>) -> String {
    let Some(ts) = creation.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) else {
        return "-".to_string();
    };
    let mut secs = (chrono::Utc::now().timestamp() - ts.timestamp()).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{secs}s")
    }
}

/// Left-aligned columns sized to the widest cell; the last column is not padded.
pub fn render_table(rows: &[Vec<String>], indent: &str) -> String {
    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; cols];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for row in rows {
        let mut line = String::from(indent);
        for (i, cell) in row.iter().enumerate() {
            if i + 1 == row.len() {
                line.push_str(cell);
            } else {
                let _ = write!(line, "{:<w$}  ", cell, w = widths[i]);
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn ready_columns(obj: &Instance) -> (String, String) {
    match obj.conditions().into_iter().find(|c| c.type_ == READY) {
        Some(c) if obj.generation_current() => (c.status.to_string(), c.reason),
        Some(_) => ("Unknown".into(), "Reconciling".into()),
        None => ("-".into(), String::new()),
    }
}

pub fn format_list(descriptor: &Descriptor, items: &[Instance], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => {
            let mut rows = vec![vec!["NAME".to_string()]];
            if !descriptor.namespaced {
                rows[0].extend(["READY", "REASON", "AGE"].map(String::from));
            } else {
                rows[0].extend(["NAMESPACE", "READY", "REASON", "AGE"].map(String::from));
            }
            for obj in items {
                let (ready, reason) = ready_columns(obj);
                let mut row = vec![obj.name().to_string()];
                if descriptor.namespaced {
                    row.push(obj.namespace().unwrap_or("-").to_string());
                }
                row.extend([ready, reason, render_age(obj.metadata.creation_timestamp.as_deref())]);
                rows.push(row);
            }
            Ok(render_table(&rows, ""))
        }
        OutputFormat::Json => {
            let list = json!({"apiVersion": "v1", "kind": "List", "items": items});
            Ok(format!("{}\n", serde_json::to_string_pretty(&list)?))
        }
        OutputFormat::Yaml => {
            let list = json!({"apiVersion": "v1", "kind": "List", "items": items});
            to_yaml(&list)
        }
        OutputFormat::Name => Ok(items
            .iter()
            .map(|o| format!("{}/{}\n", descriptor.qualified_resource(), o.name()))
            .collect()),
    }
}

fn describe(obj: &Instance) -> Result<String> {
    let meta = &obj.metadata;
    let none = || "<none>".to_string();
    let join = |m: &std::collections::BTreeMap<String, String>| {
        if m.is_empty() {
            none()
        } else {
            m.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
        }
    };

    let mut rows = vec![
        vec!["Name:".to_string(), meta.name.clone()],
        vec!["Namespace:".to_string(), meta.namespace.clone().unwrap_or_else(none)],
        vec!["API Version:".to_string(), obj.api_version.clone()],
        vec!["Kind:".to_string(), obj.kind.clone()],
        vec!["Generation:".to_string(), meta.generation.to_string()],
        vec!["Labels:".to_string(), join(&meta.labels)],
        vec!["Annotations:".to_string(), join(&meta.annotations)],
        vec!["Created:".to_string(), meta.creation_timestamp.clone().unwrap_or_else(none)],
    ];
    if let Some(ts) = &meta.deletion_timestamp {
        rows.push(vec!["Deleting:".to_string(), ts.clone()]);
    }
    if !meta.finalizers.is_empty() {
        rows.push(vec!["Finalizers:".to_string(), meta.finalizers.join(",")]);
    }
    let mut out = render_table(&rows, "");

    let conditions = obj.conditions();
    if !conditions.is_empty() {
        out.push_str("Conditions:\n");
        let mut rows = vec![["TYPE", "STATUS", "REASON", "MESSAGE"].map(String::from).to_vec()];
        for c in conditions {
            rows.push(vec![c.type_, c.status.to_string(), c.reason, c.message]);
        }
        out.push_str(&render_table(&rows, "  "));
    }
    if let Some(spec) = obj.spec() {
        out.push_str("Spec:\n");
        let yaml = to_yaml(spec)?;
        for line in yaml.lines() {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out)
}

pub fn format_one(descriptor: &Descriptor, obj: &Instance, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => describe(obj),
        OutputFormat::Json => Ok(format!("{}\n", serde_json::to_string_pretty(obj)?)),
        OutputFormat::Yaml => to_yaml(obj),
        OutputFormat::Name => Ok(format!("{}/{}\n", descriptor.qualified_resource(), obj.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{Condition, ConditionStatus};
    use serde_json::json;

    const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");

    fn app(name: &str) -> Instance {
        let mut obj = Instance::new(&APPS, Some("prod"), name);
        obj.metadata.generation = 1;
        obj.set_observed_generation(1).unwrap();
        obj.set_condition(Condition::new("Ready", ConditionStatus::True).with_reason("Deployed", "")).unwrap();
        obj
    }

    #[test]
    fn table_aligns_columns() {
        let text = format_list(&APPS, &[app("web"), app("worker-long")], OutputFormat::Table).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "NAME         NAMESPACE  READY  REASON    AGE");
        assert!(lines[1].starts_with("web          prod       True   Deployed  -"));
    }

    #[test]
    fn name_output_uses_qualified_resource() {
        let text = format_list(&APPS, &[app("web")], OutputFormat::Name).unwrap();
        assert_eq!(text, "deployments.apps/web\n");
    }

    #[test]
    fn json_list_wraps_items() {
        let text = format_list(&APPS, &[app("web")], OutputFormat::Json).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["kind"], json!("List"));
        assert_eq!(v["items"][0]["metadata"]["name"], json!("web"));
    }

    #[test]
    fn describe_shows_conditions_and_spec() {
        let mut obj = app("web");
        obj.set_path("spec.replicas", json!(3)).unwrap();
        let text = format_one(&APPS, &obj, OutputFormat::Table).unwrap();
        assert!(text.starts_with("Name:         web\n"));
        assert!(text.contains("Conditions:\n  TYPE   STATUS  REASON    MESSAGE\n  Ready  True    Deployed\n"));
        assert!(text.contains("Spec:\n  replicas: 3\n"));
    }

    #[test]
    fn age_formats_like_kubectl() {
        assert_eq!(render_age(None), "-");
        let ts = (chrono::Utc::now() - chrono::Duration::hours(3)).to_rfc3339();
        assert_eq!(render_age(Some(&ts)), "3h0m");
    }
}
