//! Shared fixtures and scripted transports for the test modules.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use plist::{Dictionary, Value};

use crate::img3::{len, tag, MAGIC};
use crate::logging::Verbosity;
use crate::session::Session;
use crate::transport::{
    Backend, DeviceEvent, EventObserver, ImageStreamer, NormalLink, RecoveryLink, RestoreLink,
};
use crate::tss::SigningAuthority;
use crate::{Bundle, Error, Result, Ticket};

/// Ticket entry name / archive path pairs of the fixture firmware.
pub(crate) const COMPONENTS: &[(&str, &str)] = &[
    ("iBEC", "Firmware/dfu/iBEC.n88ap.RELEASE.dfu"),
    (
        "AppleLogo",
        "Firmware/all_flash/all_flash.n88ap.production/applelogo.s5l8920x.img3",
    ),
    (
        "DeviceTree",
        "Firmware/all_flash/all_flash.n88ap.production/DeviceTree.n88ap.img3",
    ),
    ("Ramdisk", "018-6304-385.dmg"),
    ("KernelCache", "Firmware/kernelcache.release.s5l8920x"),
    (
        "LLB",
        "Firmware/all_flash/all_flash.n88ap.production/LLB.n88ap.RELEASE.img3",
    ),
    (
        "iBoot",
        "Firmware/all_flash/all_flash.n88ap.production/iBoot.n88ap.RELEASE.img3",
    ),
];

/// Archive path of the fixture filesystem image.
pub(crate) const OS_IMAGE: &str = "018-6303-385.dmg";

fn img3_chunk(tag_value: u32, payload: &[u8]) -> Vec<u8> {
    let total_len = (len::CHUNK_HEADER + payload.len() + 3) & !3;

    let mut out = Vec::new();
    out.extend_from_slice(&tag_value.to_le_bytes());
    out.extend_from_slice(&(total_len as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.resize(total_len, 0);

    out
}

/// Build a small signable container seeded from the component name.
pub(crate) fn component_image(component: &str) -> Vec<u8> {
    let seed = component.bytes().fold(0u8, |acc, b| acc ^ b);

    let mut data = Vec::new();
    data.extend_from_slice(&img3_chunk(tag::TYPE, b"test"));
    data.extend_from_slice(&img3_chunk(tag::DATA, &[seed; 32]));
    let sig_offset = data.len() as u32;
    data.extend_from_slice(&img3_chunk(tag::SHSH, &[0u8; 20]));
    data.extend_from_slice(&img3_chunk(tag::CERT, &[!seed; 8]));

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&((len::HEADER + data.len()) as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&sig_offset.to_le_bytes());
    out.extend_from_slice(&u32::from_le_bytes(*b"test").to_le_bytes());
    out.extend_from_slice(&data);

    out
}

pub(crate) fn kernelcache_img3() -> Vec<u8> {
    component_image("KernelCache")
}

fn ticket_blob(component: &str) -> Vec<u8> {
    format!("SIG-{component}").into_bytes()
}

fn ticket_with(components: &[(&str, &str)]) -> Ticket {
    let mut root = Dictionary::new();
    root.insert("ServerVersion".into(), Value::String("2.0.0".into()));

    let mut info = Dictionary::new();
    info.insert("Path".into(), Value::String(OS_IMAGE.into()));
    let mut os = Dictionary::new();
    os.insert("Info".into(), Value::Dictionary(info));
    root.insert("OS".into(), Value::Dictionary(os));

    for (component, path) in components {
        let mut entry = Dictionary::new();
        entry.insert("Path".into(), Value::String((*path).into()));
        entry.insert("Blob".into(), Value::Data(ticket_blob(component)));
        root.insert((*component).into(), Value::Dictionary(entry));
    }

    Ticket::new(root)
}

pub(crate) fn fixture_ticket() -> Ticket {
    ticket_with(COMPONENTS)
}

pub(crate) fn fixture_ticket_without(missing: &str) -> Ticket {
    let components: Vec<(&str, &str)> = COMPONENTS
        .iter()
        .copied()
        .filter(|(component, _)| *component != missing)
        .collect();

    ticket_with(&components)
}

fn manifest_xml() -> Vec<u8> {
    let mut components = Dictionary::new();
    for (component, path) in COMPONENTS {
        let mut info = Dictionary::new();
        info.insert("Path".into(), Value::String((*path).into()));
        let mut entry = Dictionary::new();
        entry.insert("Info".into(), Value::Dictionary(info));
        components.insert((*component).into(), Value::Dictionary(entry));
    }

    let mut os_info = Dictionary::new();
    os_info.insert("Path".into(), Value::String(OS_IMAGE.into()));
    let mut os = Dictionary::new();
    os.insert("Info".into(), Value::Dictionary(os_info));
    components.insert("OS".into(), Value::Dictionary(os));

    let mut identity = Dictionary::new();
    identity.insert("ApBoardID".into(), Value::String("0x00".into()));
    identity.insert("ApChipID".into(), Value::String("0x8920".into()));
    identity.insert("ApSecurityDomain".into(), Value::String("0x01".into()));
    identity.insert("UniqueBuildID".into(), Value::Data(vec![0xab; 8]));
    identity.insert("Manifest".into(), Value::Dictionary(components));

    let mut root = Dictionary::new();
    root.insert("BuildIdentities".into(), Value::Array(vec![Value::Dictionary(identity)]));
    root.insert("ProductVersion".into(), Value::String("3.1.2".into()));

    let mut xml = Vec::new();
    Value::Dictionary(root).to_writer_xml(&mut xml).unwrap();

    xml
}

/// Serialize the fixture firmware bundle as ZIP bytes.
pub(crate) fn fixture_zip_bytes() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);

    writer.start_file("BuildManifest.plist", options).unwrap();
    writer.write_all(&manifest_xml()).unwrap();

    writer.start_file(OS_IMAGE, options).unwrap();
    writer.write_all(&[0x5a; 4096]).unwrap();

    for (component, path) in COMPONENTS {
        writer.start_file(path.to_string(), options).unwrap();
        writer.write_all(&component_image(component)).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

/// Open the fixture bundle.
///
/// The backing temp file is unlinked immediately; the archive keeps
/// reading through its open handle.
pub(crate) fn fixture_bundle() -> Bundle {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), fixture_zip_bytes()).unwrap();

    Bundle::open(file.path()).unwrap()
}

pub(crate) fn fixture_session() -> Session {
    Session::new(false, Verbosity::Normal, None)
}

pub(crate) fn progress_msg(operation: u64, progress: i64) -> Value {
    let mut msg = Dictionary::new();
    msg.insert("MsgType".into(), Value::String("ProgressMsg".into()));
    msg.insert("Operation".into(), Value::Integer(operation.into()));
    msg.insert("Progress".into(), Value::Integer(progress.into()));

    Value::Dictionary(msg)
}

pub(crate) fn status_msg(status: u64) -> Value {
    let mut msg = Dictionary::new();
    msg.insert("MsgType".into(), Value::String("StatusMsg".into()));
    msg.insert("Status".into(), Value::Integer(status.into()));

    Value::Dictionary(msg)
}

pub(crate) fn request_msg(data_type: &str) -> Value {
    let mut msg = Dictionary::new();
    msg.insert("MsgType".into(), Value::String("DataRequestMsg".into()));
    msg.insert("DataType".into(), Value::String(data_type.into()));

    Value::Dictionary(msg)
}

/// Restore link that plays back a scripted receive sequence and records
/// everything sent to it.
pub(crate) struct ScriptedLink {
    service_type: String,
    script: VecDeque<Result<Option<Value>>>,
    sent: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedLink {
    pub(crate) fn new(service_type: &str, script: Vec<Result<Option<Value>>>) -> Self {
        Self {
            service_type: service_type.into(),
            script: script.into(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn sent(&self) -> Arc<Mutex<Vec<Value>>> {
        self.sent.clone()
    }
}

impl RestoreLink for ScriptedLink {
    fn query_type(&mut self) -> Result<String> {
        Ok(self.service_type.clone())
    }

    fn start_restore(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Value>> {
        self.script.pop_front().unwrap_or(Ok(None))
    }

    fn send(&mut self, msg: &Value) -> Result<()> {
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

/// Streamer that records which images it was asked to pipe.
#[derive(Default)]
pub(crate) struct RecordingStreamer {
    streamed: Arc<Mutex<Vec<PathBuf>>>,
}

impl RecordingStreamer {
    pub(crate) fn streamed(&self) -> Arc<Mutex<Vec<PathBuf>>> {
        self.streamed.clone()
    }
}

impl ImageStreamer for RecordingStreamer {
    fn stream(&mut self, image: &Path) -> Result<()> {
        self.streamed.lock().unwrap().push(image.into());
        Ok(())
    }
}

struct FakeNormal {
    ecid: u64,
    entered: Arc<AtomicBool>,
}

impl NormalLink for FakeNormal {
    fn unique_chip_id(&mut self) -> Result<u64> {
        Ok(self.ecid)
    }

    fn enter_recovery(&mut self) -> Result<()> {
        self.entered.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeRecovery {
    ecid: u64,
    uploads: Arc<Mutex<Vec<Vec<u8>>>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl RecoveryLink for FakeRecovery {
    fn ecid(&mut self) -> Result<u64> {
        Ok(self.ecid)
    }

    fn upload(&mut self, image: &[u8]) -> Result<()> {
        self.uploads.lock().unwrap().push(image.to_vec());
        Ok(())
    }

    fn command(&mut self, cmd: &str) -> Result<()> {
        self.commands.lock().unwrap().push(cmd.into());
        Ok(())
    }
}

/// Backend with scripted devices.
///
/// Hotplug events listed in `auto_events` fire synchronously as soon as
/// the observer subscribes; tests can also emit events by hand.
pub(crate) struct FakeBackend {
    normal_ecid: Option<u64>,
    recovery_ecid: Option<u64>,
    pub(crate) uploads: Arc<Mutex<Vec<Vec<u8>>>>,
    pub(crate) commands: Arc<Mutex<Vec<String>>>,
    entered: Arc<AtomicBool>,
    observer: Mutex<Option<EventObserver>>,
    restore_link: Mutex<Option<Box<dyn RestoreLink>>>,
    streamer: Mutex<Option<Box<dyn ImageStreamer>>>,
    auto_events: Mutex<Vec<DeviceEvent>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self {
            normal_ecid: None,
            recovery_ecid: None,
            uploads: Arc::new(Mutex::new(Vec::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
            entered: Arc::new(AtomicBool::new(false)),
            observer: Mutex::new(None),
            restore_link: Mutex::new(None),
            streamer: Mutex::new(None),
            auto_events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_normal(mut self, ecid: u64) -> Self {
        self.normal_ecid = Some(ecid);
        self
    }

    pub(crate) fn with_recovery(mut self, ecid: u64) -> Self {
        self.recovery_ecid = Some(ecid);
        self
    }

    pub(crate) fn with_restore(self, link: Box<dyn RestoreLink>) -> Self {
        *self.restore_link.lock().unwrap() = Some(link);
        self
    }

    pub(crate) fn with_streamer(self, streamer: Box<dyn ImageStreamer>) -> Self {
        *self.streamer.lock().unwrap() = Some(streamer);
        self
    }

    pub(crate) fn with_auto_events(self, events: Vec<DeviceEvent>) -> Self {
        *self.auto_events.lock().unwrap() = events;
        self
    }

    pub(crate) fn entered_recovery(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        if let Some(observer) = self.observer.lock().unwrap().as_ref() {
            observer(event);
        }
    }
}

impl Backend for FakeBackend {
    fn open_normal(&self, _uuid: Option<&str>) -> Result<Option<Box<dyn NormalLink>>> {
        if self.entered_recovery() {
            return Ok(None);
        }

        Ok(self.normal_ecid.map(|ecid| {
            Box::new(FakeNormal {
                ecid,
                entered: self.entered.clone(),
            }) as Box<dyn NormalLink>
        }))
    }

    fn open_recovery(&self) -> Result<Option<Box<dyn RecoveryLink>>> {
        Ok(self.recovery_ecid.map(|ecid| {
            Box::new(FakeRecovery {
                ecid,
                uploads: self.uploads.clone(),
                commands: self.commands.clone(),
            }) as Box<dyn RecoveryLink>
        }))
    }

    fn open_restore(&self) -> Result<Box<dyn RestoreLink>> {
        self.restore_link
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::transport("restore-protocol", "no scripted restore link"))
    }

    fn open_streamer(&self) -> Result<Box<dyn ImageStreamer>> {
        self.streamer
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::transport("asr", "no scripted streamer"))
    }

    fn subscribe(&self, observer: EventObserver) -> Result<()> {
        *self.observer.lock().unwrap() = Some(observer);

        let events: Vec<DeviceEvent> = self.auto_events.lock().unwrap().drain(..).collect();
        for event in events {
            self.emit(event);
        }

        Ok(())
    }
}

/// Signing authority returning a canned ticket, or a scripted outage.
pub(crate) struct FakeAuthority {
    ticket: Option<Ticket>,
}

impl FakeAuthority {
    pub(crate) fn with_ticket(ticket: Ticket) -> Self {
        Self {
            ticket: Some(ticket),
        }
    }

    pub(crate) fn outage() -> Self {
        Self { ticket: None }
    }
}

impl SigningAuthority for FakeAuthority {
    fn exchange(&self, _request: &Dictionary) -> Result<Ticket> {
        self.ticket
            .clone()
            .ok_or_else(|| Error::signing("empty response body"))
    }
}
