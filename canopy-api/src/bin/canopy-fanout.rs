//! Mutation Fan-Out Inspector
//!
//! Prints the tags a resource mutation would invalidate, as JSON on stdout.
//!
//! Usage:
//!   cargo run -p canopy-api --bin canopy-fanout -- plant p1 growId=g1
//!   cargo run -p canopy-api --bin canopy-fanout -- grow g1 organizationId=o1 --detached userId --op delete
//!
//! Grows and tasks must name every parent they may belong to, either as
//! `key=value` or with `--detached key`.
//!   cargo run -p canopy-api --bin canopy-fanout -- plant p1 growId=g1 --covers plants-by-grow:g1

use canopy_cache::{InvalidationGraph, Tag, TagRegistry};
use canopy_core::{MutationOperation, ParentKind, ResourceMutationEvent, ResourceType};
use serde_json::json;

const USAGE: &str =
    "usage: canopy-fanout <resource> <id> [organizationId=..] [userId=..] [growId=..] [--detached <key>] [--op create|update|delete] [--covers <tag>]";

struct Request {
    event: ResourceMutationEvent,
    covers: Option<Tag>,
}

fn parse_args(args: &[String]) -> Result<Request, String> {
    let mut positional = Vec::new();
    let mut parents = Vec::new();
    let mut operation = MutationOperation::Update;
    let mut covers = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--op" {
            let value = iter.next().ok_or("--op needs a value")?;
            operation = value.parse()?;
        } else if arg == "--covers" {
            let raw = iter.next().ok_or("--covers needs a tag")?;
            let tag: Tag = raw.parse().map_err(|e| format!("{}", e))?;
            // Accept declared aliases and report the canonical form.
            let tag = TagRegistry::standard()
                .normalize(&tag)
                .map_err(|e| format!("{}", e))?;
            covers = Some(tag);
        } else if let Some((key, value)) = arg.split_once('=') {
            let kind = ParentKind::from_id_key(key)
                .ok_or_else(|| format!("unknown parent key: {}", key))?;
            parents.push((kind, Some(value.to_string())));
        } else if arg == "--detached" {
            let key = iter.next().ok_or("--detached needs a parent key")?;
            let kind = ParentKind::from_id_key(key)
                .ok_or_else(|| format!("unknown parent key: {}", key))?;
            parents.push((kind, None));
        } else {
            positional.push(arg.as_str());
        }
    }

    let [resource, id] = positional.as_slice() else {
        return Err(USAGE.to_string());
    };
    let resource: ResourceType = resource.parse()?;

    let event = parents.into_iter().fold(
        ResourceMutationEvent::new(resource, *id, operation),
        |event, (kind, value)| match value {
            Some(value) => event.with_parent(kind, value),
            None => event.without_parent(kind),
        },
    );
    Ok(Request { event, covers })
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let Request { event, covers } = match parse_args(&args) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let tags = match InvalidationGraph::new().resolve(&event) {
        Ok(tags) => tags,
        Err(e) => {
            eprintln!("Failed to resolve fan-out: {}", e);
            std::process::exit(1);
        }
    };

    let mut output = json!({
        "event": event,
        "tags": tags.iter().map(|tag| tag.encode()).collect::<Vec<_>>(),
    });
    if let Some(tag) = covers {
        output["covers"] = json!({ "tag": tag.encode(), "invalidated": tags.contains(&tag) });
    }
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to serialize fan-out: {}", e);
            std::process::exit(1);
        }
    }
}
