//! Typed access to property-list trees.
//!
//! The XML codec itself is the `plist` crate; this module is the thin
//! typed façade the rest of the crate goes through. Every accessor takes
//! a `context` string naming the node being read, which becomes the
//! payload of the schema error on a wrong-type access. Nothing here
//! panics on malformed input.

use std::io::Cursor;

use plist::{Dictionary, Value};

use crate::{Error, Result};

/// Fetch a key from a dictionary.
pub fn dict_get<'a>(dict: &'a Dictionary, key: &str, context: &str) -> Result<&'a Value> {
    dict.get(key)
        .ok_or_else(|| Error::schema(format!("{context}: missing key {key}")))
}

/// View a node as a dictionary.
pub fn as_dict<'a>(node: &'a Value, context: &str) -> Result<&'a Dictionary> {
    node.as_dictionary()
        .ok_or_else(|| Error::schema(format!("{context}: expected dict")))
}

/// View a node as a string.
pub fn as_string<'a>(node: &'a Value, context: &str) -> Result<&'a str> {
    node.as_string()
        .ok_or_else(|| Error::schema(format!("{context}: expected string")))
}

/// View a node as an unsigned 64-bit integer.
pub fn as_u64(node: &Value, context: &str) -> Result<u64> {
    node.as_unsigned_integer()
        .ok_or_else(|| Error::schema(format!("{context}: expected unsigned integer")))
}

/// View a node as a byte blob.
pub fn as_data<'a>(node: &'a Value, context: &str) -> Result<&'a [u8]> {
    node.as_data()
        .ok_or_else(|| Error::schema(format!("{context}: expected data")))
}

/// Iterate a dictionary's `(key, node)` pairs in document order.
pub fn entries(dict: &Dictionary) -> impl Iterator<Item = (&str, &Value)> {
    dict.iter().map(|(key, node)| (key.as_str(), node))
}

/// Parsed `BuildManifest.plist`.
#[derive(Clone, Debug)]
pub struct Manifest {
    root: Dictionary,
}

impl Manifest {
    /// Decode a manifest from XML bytes.
    pub fn from_xml(bytes: &[u8]) -> Result<Self> {
        let root = Value::from_reader_xml(Cursor::new(bytes))
            .map_err(|err| Error::schema(format!("BuildManifest: {err}")))?;
        let root = as_dict(&root, "BuildManifest")?.clone();

        Ok(Self { root })
    }

    /// Get the manifest root dictionary.
    pub fn root(&self) -> &Dictionary {
        &self.root
    }

    /// Get the first build identity.
    ///
    /// The manifest carries one identity per (board, erase/update) pair;
    /// the restore flow signs against the first.
    pub fn build_identity(&self) -> Result<&Dictionary> {
        let identities = dict_get(&self.root, "BuildIdentities", "BuildManifest")?;
        let identities = identities
            .as_array()
            .ok_or_else(|| Error::schema("BuildIdentities: expected array"))?;
        let first = identities
            .first()
            .ok_or_else(|| Error::schema("BuildIdentities: empty array"))?;

        as_dict(first, "BuildIdentities[0]")
    }

    /// Get the `OS.Info.Path` of the first build identity: the
    /// archive-relative path of the filesystem image.
    pub fn os_image_path(&self) -> Result<&str> {
        let identity = self.build_identity()?;
        let manifest = as_dict(
            dict_get(identity, "Manifest", "BuildIdentities[0]")?,
            "BuildIdentities[0].Manifest",
        )?;
        let os = as_dict(dict_get(manifest, "OS", "Manifest")?, "Manifest.OS")?;
        let info = as_dict(dict_get(os, "Info", "Manifest.OS")?, "Manifest.OS.Info")?;

        as_string(dict_get(info, "Path", "Manifest.OS.Info")?, "Manifest.OS.Info.Path")
    }
}
