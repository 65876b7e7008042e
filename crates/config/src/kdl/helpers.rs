//! Accessors for KDL child entries.
//!
//! Settings are written as child nodes with a single argument
//! (`timeout-secs 30`), so every getter looks up the named child of a block.

use anyhow::Result;
use kdl::{KdlNode, KdlValue};

/// First argument of the named child node
fn child_arg<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    node.children()?.get_arg(name)
}

pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    child_arg(node, name)?.as_string().map(str::to_string)
}

fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    child_arg(node, name)?.as_integer()
}

pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    child_arg(node, name)?.as_bool()
}

/// Non-negative integer entry, rejecting negative and oversized values
pub fn get_u64_entry(node: &KdlNode, name: &str) -> Result<Option<u64>> {
    get_bounded_entry(node, name)
}

/// Like [`get_u64_entry`] for counters stored as `u32`
pub fn get_u32_entry(node: &KdlNode, name: &str) -> Result<Option<u32>> {
    get_bounded_entry(node, name)
}

pub fn get_usize_entry(node: &KdlNode, name: &str) -> Result<Option<usize>> {
    get_bounded_entry(node, name)
}

fn get_bounded_entry<T: TryFrom<i128>>(node: &KdlNode, name: &str) -> Result<Option<T>> {
    get_int_entry(node, name)
        .map(|v| {
            T::try_from(v).map_err(|_| {
                anyhow::anyhow!(
                    "'{}' must be a non-negative integer of at most {} bits, got {}",
                    name,
                    std::mem::size_of::<T>() * 8,
                    v
                )
            })
        })
        .transpose()
}

/// All string arguments of the named child node
pub fn get_string_args(node: &KdlNode, name: &str) -> Vec<String> {
    node.children()
        .map(|children| {
            children
                .iter_args(name)
                .into_iter()
                .filter_map(|v| v.as_string().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// First positional argument of the node itself, e.g. the ID in
/// `hook "reload" { ... }`
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .and_then(|entry| entry.value().as_string())
        .map(str::to_string)
}
