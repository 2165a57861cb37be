use std::collections::BTreeMap;
use std::io::Write;

use corral_core::Resource;
use similar::{ChangeTag, TextDiff};

/// Boxed object test, the shape [`all`] combines.
pub type Predicate<K> = Box<dyn Fn(&K) -> bool + Send + Sync>;

/// Boxed in-place edit, the shape [`mutator_list`] chains.
pub type Mutator<K> = Box<dyn Fn(&mut K) -> anyhow::Result<()> + Send + Sync>;

/// Predicate matching objects whose label `key` equals `value`.
pub fn label_equals<K: Resource>(key: &str, value: &str) -> impl Fn(&K) -> bool + Send + Sync {
    let (key, value) = (key.to_string(), value.to_string());
    move |obj: &K| obj.metadata().labels.get(&key) == Some(&value)
}

/// Predicate matching objects that carry label `key`, whatever its value.
pub fn labels_contain<K: Resource>(key: &str) -> impl Fn(&K) -> bool + Send + Sync {
    let key = key.to_string();
    move |obj: &K| obj.metadata().labels.contains_key(&key)
}

/// Passes when every child passes; an empty list passes everything.
pub fn all<K: Resource>(children: Vec<Predicate<K>>) -> impl Fn(&K) -> bool + Send + Sync {
    move |obj: &K| children.iter().all(|p| p(obj))
}

/// Applies each mutator in order, stopping at the first error.
pub fn mutator_list<K: Resource>(mutators: Vec<Mutator<K>>) -> impl Fn(&mut K) -> anyhow::Result<()> + Send + Sync {
    move |obj: &mut K| mutators.iter().try_for_each(|m| m(obj))
}

/// Sets `labels` on the object, overwriting existing values for the same keys.
pub fn label_set_mutator<K: Resource>(labels: BTreeMap<String, String>) -> impl Fn(&mut K) -> anyhow::Result<()> + Send + Sync {
    move |obj: &mut K| {
        let current = &mut obj.metadata_mut().labels;
        current.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Wrap a mutator so every successful application writes a line diff of the
/// object (as pretty JSON) to `out` under a `<friendly> Diff` header, or
/// `No changes` when it was left untouched.
pub fn diff_wrapper<K, W, F>(friendly: &str, mut out: W, mut mutator: F) -> impl FnMut(&mut K) -> anyhow::Result<()> + Send
where
    K: Resource,
    W: Write + Send,
    F: FnMut(&mut K) -> anyhow::Result<()> + Send,
{
    let friendly = friendly.to_string();
    move |obj: &mut K| {
        let before = serde_json::to_string_pretty(&*obj)?;
        mutator(obj)?;
        let after = serde_json::to_string_pretty(&*obj)?;
        write_diff(&mut out, &friendly, &before, &after)?;
        Ok(())
    }
}

fn write_diff(out: &mut impl Write, friendly: &str, before: &str, after: &str) -> std::io::Result<()> {
    if before == after {
        return writeln!(out, "No changes");
    }
    writeln!(out, "{friendly} Diff (-old +new):")?;
    let diff = TextDiff::from_lines(before, after);
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        write!(out, "{sign} {change}")?;
        if change.missing_newline() {
            writeln!(out)?;
        }
    }
    Ok(())
}
