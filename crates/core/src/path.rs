//! Dotted-path access into untyped JSON bodies.
//!
//! Paths look like `spec.template.containers[0].image`: keys separated by
//! dots, each optionally followed by a single `[index]`. A leading dot is
//! accepted.

use serde_json::{Map, Value};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn parse(p: &str) -> Result<Vec<Segment<'_>>> {
    let s = p.strip_prefix('.').unwrap_or(p);
    if s.is_empty() {
        return Err(Error::Validation("empty path".into()));
    }
    let mut out = Vec::new();
    for seg in s.split('.') {
        let (key, index) = match seg.find('[') {
            Some(open) => {
                let close = seg.len() - 1;
                if !seg.ends_with(']') || open + 1 >= close {
                    return Err(Error::Validation(format!("invalid index in path segment {seg:?}")));
                }
                let idx = seg[open + 1..close]
                    .parse::<usize>()
                    .map_err(|_| Error::Validation(format!("invalid index in path segment {seg:?}")))?;
                (&seg[..open], Some(idx))
            }
            None => (seg, None),
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(Error::Validation(format!("invalid path segment {seg:?} in {p:?}")));
        }
        out.push(Segment::Key(key));
        if let Some(i) = index {
            out.push(Segment::Index(i));
        }
    }
    Ok(out)
}

pub fn get<'a>(root: &'a Value, p: &str) -> Option<&'a Value> {
    let segs = parse(p).ok()?;
    let mut cur = root;
    for seg in segs {
        cur = match seg {
            Segment::Key(k) => cur.as_object()?.get(k)?,
            Segment::Index(i) => cur.as_array()?.get(i)?,
        };
    }
    Some(cur)
}

/// Set `value` at `p`, creating intermediate objects. Array indexes must
/// already exist; a scalar in the way is an error.
pub fn set(root: &mut Value, p: &str, value: Value) -> Result<()> {
    let segs = parse(p)?;
    let mut cur = root;
    for (pos, seg) in segs.iter().enumerate() {
        let last = pos + 1 == segs.len();
        match seg {
            Segment::Key(k) => {
                if cur.is_null() {
                    *cur = Value::Object(Map::new());
                }
                let obj = cur
                    .as_object_mut()
                    .ok_or_else(|| Error::Validation(format!("{p:?}: {k:?} is not inside an object")))?;
                if last {
                    obj.insert((*k).to_string(), value);
                    return Ok(());
                }
                cur = obj.entry((*k).to_string()).or_insert(Value::Null);
            }
            Segment::Index(i) => {
                let arr = cur
                    .as_array_mut()
                    .ok_or_else(|| Error::Validation(format!("{p:?}: index {i} applied to a non-array")))?;
                let len = arr.len();
                let slot = arr
                    .get_mut(*i)
                    .ok_or_else(|| Error::Validation(format!("{p:?}: index {i} out of bounds (len {len})")))?;
                if last {
                    *slot = value;
                    return Ok(());
                }
                cur = slot;
            }
        }
    }
    Ok(())
}

pub fn remove(root: &mut Value, p: &str) -> Option<Value> {
    let segs = parse(p).ok()?;
    let (last, parents) = segs.split_last()?;
    let mut cur = root;
    for seg in parents {
        cur = match seg {
            Segment::Key(k) => cur.as_object_mut()?.get_mut(*k)?,
            Segment::Index(i) => cur.as_array_mut()?.get_mut(*i)?,
        };
    }
    match last {
        Segment::Key(k) => cur.as_object_mut()?.remove(*k),
        Segment::Index(i) => {
            let arr = cur.as_array_mut()?;
            (*i < arr.len()).then(|| arr.remove(*i))
        }
    }
}
