//! Signing-ticket store.
//!
//! The ticket is the signing authority's response: one top-level entry
//! per signable component, each holding the component's archive `Path`
//! and its per-device signature `Blob`. Components are addressed either
//! by entry name or by archive path; both resolutions funnel through one
//! [find](Ticket::find) operation so the two paths cannot drift.

use std::fmt;

use plist::{Dictionary, Value};

use crate::props::{as_dict, as_string, dict_get};
use crate::{Error, Result};

/// How to address a ticket entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Selector<'a> {
    /// Top-level entry name, e.g. `KernelCache`
    Name(&'a str),
    /// Archive-relative component path, e.g. `Firmware/all_flash/LLB.img3`
    Path(&'a str),
}

impl fmt::Display for Selector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name {name}"),
            Self::Path(path) => write!(f, "path {path}"),
        }
    }
}

/// A resolved ticket entry.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedEntry {
    /// Top-level ticket key
    pub name: String,
    /// Archive-relative path of the component
    pub path: String,
    /// Signature blob for this device
    pub blob: Vec<u8>,
}

/// The signing authority's response, indexed for component lookup.
#[derive(Clone, Debug)]
pub struct Ticket {
    root: Dictionary,
}

impl Ticket {
    pub fn new(root: Dictionary) -> Self {
        Self { root }
    }

    /// Decode a ticket from a property-list node.
    pub fn from_value(node: &Value) -> Result<Self> {
        Ok(Self::new(as_dict(node, "ticket")?.clone()))
    }

    /// Resolve a component.
    ///
    /// Name lookups are strict: the named entry must exist and carry
    /// `Path` and `Blob` of the right kinds. Path lookups scan entries in
    /// ticket order and take the first whose `Path` matches; top-level
    /// entries that are not component dicts (the authority adds e.g. a
    /// `ServerVersion` string) are skipped.
    pub fn find(&self, selector: Selector) -> Result<SignedEntry> {
        match selector {
            Selector::Name(name) => {
                let node = self
                    .root
                    .get(name)
                    .ok_or_else(|| Error::TicketEntryMissing(name.into()))?;

                entry_from(name, node)
            }
            Selector::Path(path) => {
                for (name, node) in self.root.iter() {
                    let Some(entry) = node.as_dictionary() else {
                        continue;
                    };
                    let Some(entry_path) = entry.get("Path").and_then(Value::as_string) else {
                        continue;
                    };

                    if entry_path == path {
                        return entry_from(name.as_str(), node);
                    }
                }

                Err(Error::TicketPathMissing(path.into()))
            }
        }
    }

    /// Iterate every component entry in ticket order, skipping top-level
    /// nodes that are not component dicts.
    pub fn signed_entries(&self) -> impl Iterator<Item = Result<SignedEntry>> + '_ {
        self.root.iter().filter_map(|(name, node)| {
            let entry = node.as_dictionary()?;
            entry.get("Path").and_then(Value::as_string)?;

            Some(entry_from(name.as_str(), node))
        })
    }

    /// Get the archive path of the filesystem image, announced under the
    /// ticket's `OS.Info.Path`.
    pub fn os_image_path(&self) -> Result<String> {
        let os = as_dict(dict_get(&self.root, "OS", "ticket")?, "ticket.OS")?;
        let info = as_dict(dict_get(os, "Info", "ticket.OS")?, "ticket.OS.Info")?;
        let path = as_string(dict_get(info, "Path", "ticket.OS.Info")?, "ticket.OS.Info.Path")?;

        Ok(path.into())
    }
}

fn entry_from(name: &str, node: &Value) -> Result<SignedEntry> {
    let entry = node
        .as_dictionary()
        .ok_or_else(|| Error::TicketEntryMalformed(format!("{name}: expected dict")))?;

    let path = entry
        .get("Path")
        .and_then(Value::as_string)
        .ok_or_else(|| Error::TicketEntryMalformed(format!("{name}: missing Path string")))?;
    let blob = entry
        .get("Blob")
        .and_then(Value::as_data)
        .ok_or_else(|| Error::TicketEntryMalformed(format!("{name}: missing Blob data")))?;

    Ok(SignedEntry {
        name: name.into(),
        path: path.into(),
        blob: blob.into(),
    })
}
