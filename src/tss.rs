//! Signing authority (TSS) client.
//!
//! The request is a property list derived from the build manifest plus
//! the device ECID; the authority answers with the per-device signing
//! ticket. The exchange is idempotent: the same `(manifest, ecid)` pair
//! always yields the same ticket, so the operator may simply re-run the
//! tool after an outage.

use std::io::Cursor;
use std::time::Duration;

use log::{debug, info};
use plist::{Dictionary, Value};

use crate::props::{as_dict, dict_get, entries, Manifest};
use crate::{Error, Result, Ticket};

/// Signing authority endpoint.
pub const TSS_URL: &str = "https://gs.apple.com/TSS/controller?action=2";

/// Client banner sent in the request's `@VersionInfo`.
pub const TSS_VERSION_INFO: &str = "libauthinstall-107.3";

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Seam for the ticket exchange, so the pipeline can run against a
/// canned authority in tests.
pub trait SigningAuthority {
    /// Exchange a signing request for a ticket.
    fn exchange(&self, request: &Dictionary) -> Result<Ticket>;
}

/// Build the signing request for `manifest` bound to `ecid`.
///
/// Copies the identity fields the authority validates, then one entry
/// per signable component from the identity's `Manifest` dict. Component
/// entries keep their `Info` subtree, which is how the response comes
/// back with `OS.Info.Path` intact.
pub fn build_request(manifest: &Manifest, ecid: u64) -> Result<Dictionary> {
    let identity = manifest.build_identity()?;

    let mut request = Dictionary::new();
    request.insert("@APTicket".into(), Value::Boolean(true));
    request.insert("@HostPlatformInfo".into(), Value::String("mac".into()));
    request.insert("@VersionInfo".into(), Value::String(TSS_VERSION_INFO.into()));
    request.insert("ApECID".into(), Value::String(ecid.to_string()));
    request.insert("ApProductionMode".into(), Value::Boolean(true));

    for key in ["ApBoardID", "ApChipID", "ApSecurityDomain", "UniqueBuildID"] {
        let node = dict_get(identity, key, "BuildIdentities[0]")?;
        request.insert(key.into(), node.clone());
    }

    let components = as_dict(
        dict_get(identity, "Manifest", "BuildIdentities[0]")?,
        "BuildIdentities[0].Manifest",
    )?;
    for (name, node) in entries(components) {
        let mut entry = as_dict(node, "BuildIdentities[0].Manifest entry")?.clone();
        entry.insert("Trusted".into(), Value::Boolean(true));
        request.insert(name.into(), Value::Dictionary(entry));
    }

    debug!("built signing request for ECID {ecid:x} ({} entries)", request.len());

    Ok(request)
}

/// Production TSS client over blocking HTTPS.
pub struct TssClient {
    agent: reqwest::blocking::Client,
    url: String,
}

impl TssClient {
    pub fn new() -> Result<Self> {
        Self::with_url(TSS_URL)
    }

    pub fn with_url<S: Into<String>>(url: S) -> Result<Self> {
        let agent = reqwest::blocking::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()?;

        Ok(Self {
            agent,
            url: url.into(),
        })
    }
}

impl SigningAuthority for TssClient {
    fn exchange(&self, request: &Dictionary) -> Result<Ticket> {
        let mut body = Vec::new();
        Value::Dictionary(request.clone())
            .to_writer_xml(&mut body)
            .map_err(|err| Error::signing(format!("request encode: {err}")))?;

        info!("requesting signature ticket from {}", self.url);

        let response = self
            .agent
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .header("User-Agent", "InetURL/1.0")
            .body(body)
            .send()?;

        if !response.status().is_success() {
            return Err(Error::signing(format!("HTTP status {}", response.status())));
        }

        let body = response.text()?;
        let ticket = parse_response(&body)?;

        info!("signature ticket received");

        Ok(ticket)
    }
}

/// Parse the authority's form-style response wrapper:
/// `STATUS=0&MESSAGE=SUCCESS&REQUEST_STRING=<?xml ...`.
pub fn parse_response(body: &str) -> Result<Ticket> {
    if body.is_empty() {
        return Err(Error::signing("empty response body"));
    }

    let status = body
        .strip_prefix("STATUS=")
        .and_then(|rest| rest.split('&').next())
        .and_then(|status| status.parse::<i64>().ok())
        .ok_or_else(|| Error::signing("response carries no STATUS field"))?;

    let message = body
        .split('&')
        .find_map(|field| field.strip_prefix("MESSAGE="))
        .unwrap_or("(no message)");

    if status != 0 {
        return Err(Error::signing(format!("authority refused: {status} {message}")));
    }

    let xml = body
        .find("REQUEST_STRING=")
        .map(|at| &body[at + "REQUEST_STRING=".len()..])
        .ok_or_else(|| Error::signing("response carries no ticket"))?;

    let node = Value::from_reader_xml(Cursor::new(xml.as_bytes()))
        .map_err(|err| Error::signing(format!("ticket decode: {err}")))?;

    Ticket::from_value(&node).map_err(|err| Error::signing(format!("{err}")))
}
