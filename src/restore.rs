//! Restore-mode message loop.
//!
//! Once the device reboots into the restore ramdisk, the roles flip:
//! the device drives, the host serves. Inbound messages are classified
//! on `MsgType` and data-pull requests on `DataType`; unknown message
//! types are logged and skipped, but an unknown data type is terminal
//! because the agent would hang waiting for bytes we cannot produce.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use plist::{Dictionary, Value};
use serde::Deserialize;

use crate::component::{self, name, signed_image};
use crate::session::{Session, Shared};
use crate::transport::{ImageStreamer, RestoreLink};
use crate::{inner_enum, Bundle, Error, Result, Selector, Ticket};

/// Service type the restored agent reports in the handshake.
pub const RESTORED_SERVICE_TYPE: &str = "com.apple.mobile.restored";

/// Consecutive receive failures tolerated before the loop gives up.
pub const MAX_RECEIVE_FAILURES: u32 = 5;

/// `MsgType` values.
pub mod msg_type {
    pub const PROGRESS: &str = "ProgressMsg";
    pub const STATUS: &str = "StatusMsg";
    pub const DATA_REQUEST: &str = "DataRequestMsg";
}

/// `DataType` values the host can service.
pub mod data_type {
    pub const SYSTEM_IMAGE: &str = "SystemImageData";
    pub const KERNEL_CACHE: &str = "KernelCache";
    pub const NOR: &str = "NORData";
}

/// Payload of a `ProgressMsg`.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct Progress {
    #[serde(rename = "Operation", default)]
    pub operation: u64,
    #[serde(rename = "Progress", default)]
    pub progress: i64,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{{"operation": {}, "progress": {}}}"#,
            self.operation, self.progress
        )
    }
}

/// Payload of a `StatusMsg`.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct Status {
    #[serde(rename = "Status", default)]
    pub status: u64,
}

impl Status {
    /// Human-readable meaning of the device's status code.
    pub fn describe(&self) -> &'static str {
        match self.status {
            0 => "restore finished",
            2 => "failed to mount filesystem",
            6 => "disk partitioning failed",
            9 => "filesystem restore failed",
            14 => "image verification failed",
            _ => "failed with unknown status",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.status)
    }
}

/// A data type requested through `DataRequestMsg`.
#[derive(Clone, Debug, PartialEq)]
pub enum DataKind {
    SystemImage,
    KernelCache,
    Nor,
    Unknown(String),
}

impl From<&str> for DataKind {
    fn from(tag: &str) -> Self {
        match tag {
            data_type::SYSTEM_IMAGE => Self::SystemImage,
            data_type::KERNEL_CACHE => Self::KernelCache,
            data_type::NOR => Self::Nor,
            other => Self::Unknown(other.into()),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemImage => write!(f, "{}", data_type::SYSTEM_IMAGE),
            Self::KernelCache => write!(f, "{}", data_type::KERNEL_CACHE),
            Self::Nor => write!(f, "{}", data_type::NOR),
            Self::Unknown(tag) => write!(f, "{tag}"),
        }
    }
}

/// An inbound restore-protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Progress(Progress),
    Status(Status),
    DataRequest(DataKind),
    Unknown(String),
}

inner_enum!(Message, Progress);
inner_enum!(Message, Status);
inner_enum!(Message, DataRequest, DataKind);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Progress(inner) => write!(f, "{}: {inner}", msg_type::PROGRESS),
            Self::Status(inner) => write!(f, "{}: {inner}", msg_type::STATUS),
            Self::DataRequest(inner) => write!(f, "{}: {inner}", msg_type::DATA_REQUEST),
            Self::Unknown(tag) => write!(f, "unknown message {tag}"),
        }
    }
}

/// Classify an inbound message by its `MsgType`.
pub fn classify(msg: &Value) -> Message {
    let Some(dict) = msg.as_dictionary() else {
        return Message::Unknown("(not a dict)".into());
    };
    let Some(tag) = dict.get("MsgType").and_then(Value::as_string) else {
        return Message::Unknown("(missing MsgType)".into());
    };

    match tag {
        msg_type::PROGRESS => Message::Progress(plist::from_value(msg).unwrap_or_default()),
        msg_type::STATUS => Message::Status(plist::from_value(msg).unwrap_or_default()),
        msg_type::DATA_REQUEST => {
            let kind = dict
                .get("DataType")
                .and_then(Value::as_string)
                .unwrap_or_default();

            Message::DataRequest(DataKind::from(kind))
        }
        other => Message::Unknown(other.into()),
    }
}

/// The restore-mode message loop.
pub struct Dispatcher<'a> {
    link: Box<dyn RestoreLink>,
    streamer: Box<dyn ImageStreamer>,
    bundle: &'a mut Bundle,
    ticket: &'a Ticket,
    session: &'a Session,
    shared: Arc<Shared>,
    image_path: PathBuf,
    last_status: Option<Status>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        link: Box<dyn RestoreLink>,
        streamer: Box<dyn ImageStreamer>,
        bundle: &'a mut Bundle,
        ticket: &'a Ticket,
        session: &'a Session,
        image_path: PathBuf,
    ) -> Self {
        let shared = session.shared.clone();

        Self {
            link,
            streamer,
            bundle,
            ticket,
            session,
            shared,
            image_path,
            last_status: None,
        }
    }

    /// Handshake, start the restore, then serve the agent until it
    /// finishes, the channel closes, or the device is removed.
    pub fn run(&mut self) -> Result<()> {
        let ty = self.link.query_type()?;
        if ty != RESTORED_SERVICE_TYPE {
            return Err(Error::NotInRestoreMode(ty));
        }

        self.link.start_restore()?;
        info!("restore started");

        let mut failures = 0u32;
        while !self.shared.quit() {
            match self.link.receive() {
                Ok(Some(msg)) => {
                    failures = 0;
                    self.handle(&msg)?;
                }
                Ok(None) => {
                    info!("restore agent closed the channel");
                    break;
                }
                Err(err) => {
                    warn!("receive failed: {err}");
                    failures += 1;
                    if failures >= MAX_RECEIVE_FAILURES {
                        return Err(Error::transport(
                            "restore-protocol",
                            format!("{failures} consecutive receive failures"),
                        ));
                    }
                }
            }
        }

        match self.last_status {
            Some(status) if status.status != 0 => Err(Error::transport(
                "restore-protocol",
                format!("device reported: {status}"),
            )),
            _ => Ok(()),
        }
    }

    fn handle(&mut self, msg: &Value) -> Result<()> {
        match classify(msg) {
            Message::Progress(progress) => {
                debug!("progress: {progress}");
                Ok(())
            }
            Message::Status(status) => self.handle_status(status),
            Message::DataRequest(kind) => self.handle_data_request(kind),
            Message::Unknown(tag) => {
                info!("ignoring message {tag}");
                Ok(())
            }
        }
    }

    fn handle_status(&mut self, status: Status) -> Result<()> {
        if status.status == 0 {
            info!("{status}");
        } else {
            error!("{status}");
        }

        self.last_status = Some(status);
        self.shared.latch_quit();

        Ok(())
    }

    fn handle_data_request(&mut self, kind: DataKind) -> Result<()> {
        info!("device requested {kind}");

        match kind {
            DataKind::SystemImage => self.streamer.stream(&self.image_path),
            DataKind::KernelCache => {
                let (entry, bytes) = signed_image(
                    self.bundle,
                    self.ticket,
                    Selector::Name(name::KERNEL_CACHE),
                    self.session.custom,
                )?;
                if self.session.dump_images() {
                    component::dump_image(&entry, &bytes)?;
                }

                let mut reply = Dictionary::new();
                reply.insert("KernelCacheFile".into(), Value::Data(bytes));

                self.link.send(&Value::Dictionary(reply))
            }
            DataKind::Nor => self.send_nor(),
            DataKind::Unknown(tag) => Err(Error::UnknownDataType(tag)),
        }
    }

    /// Package the NOR flash set: LLB first, then every other ticket
    /// entry living in the all_flash directory, in ticket order.
    fn send_nor(&mut self) -> Result<()> {
        let (llb, llb_bytes) = signed_image(
            self.bundle,
            self.ticket,
            Selector::Name(name::LLB),
            self.session.custom,
        )?;
        if self.session.dump_images() {
            component::dump_image(&llb, &llb_bytes)?;
        }

        let mut nor_images = Vec::new();
        for entry in self.ticket.signed_entries() {
            let entry = entry?;
            if entry.name == name::LLB || !entry.path.starts_with(component::ALL_FLASH_DIR) {
                continue;
            }

            let (entry, bytes) = signed_image(
                self.bundle,
                self.ticket,
                Selector::Path(&entry.path),
                self.session.custom,
            )?;
            if self.session.dump_images() {
                component::dump_image(&entry, &bytes)?;
            }

            debug!("NOR image {} ({} bytes)", entry.name, bytes.len());
            nor_images.push(Value::Data(bytes));
        }

        let mut reply = Dictionary::new();
        reply.insert("LlbImageData".into(), Value::Data(llb_bytes));
        reply.insert("NorImageData".into(), Value::Array(nor_images));

        self.link.send(&Value::Dictionary(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        fixture_bundle, fixture_session, fixture_ticket, progress_msg, request_msg, status_msg,
        RecordingStreamer, ScriptedLink,
    };
    use crate::Img3;

    fn dispatcher_parts() -> (Bundle, Ticket, Session) {
        (fixture_bundle(), fixture_ticket(), fixture_session())
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&progress_msg(22, 45)),
            Message::Progress(Progress {
                operation: 22,
                progress: 45
            })
        );
        assert_eq!(classify(&status_msg(0)), Message::Status(Status { status: 0 }));
        assert_eq!(
            classify(&request_msg("SystemImageData")),
            Message::DataRequest(DataKind::SystemImage)
        );
        assert_eq!(
            classify(&request_msg("Unicorn")),
            Message::DataRequest(DataKind::Unknown("Unicorn".into()))
        );
        assert_eq!(
            classify(&Value::String("bogus".into())),
            Message::Unknown("(not a dict)".into())
        );

        let mut dict = Dictionary::new();
        dict.insert("MsgType".into(), Value::String("BBUpdateStatusMsg".into()));
        assert_eq!(
            classify(&Value::Dictionary(dict)),
            Message::Unknown("BBUpdateStatusMsg".into())
        );
    }

    #[test]
    fn test_message_accessors() {
        let msg = classify(&status_msg(6));
        assert!(msg.is_status());
        assert_eq!(msg.as_status().unwrap().status, 6);
        assert!(msg.as_progress().is_err());
    }

    #[test]
    fn test_handshake_mismatch() {
        let (mut bundle, ticket, session) = dispatcher_parts();
        let link = ScriptedLink::new("com.apple.mobile.lockdown", vec![]);
        let streamer = RecordingStreamer::default();

        let mut dispatcher = Dispatcher::new(
            Box::new(link),
            Box::new(streamer),
            &mut bundle,
            &ticket,
            &session,
            "image.dmg".into(),
        );

        assert_eq!(
            dispatcher.run(),
            Err(Error::NotInRestoreMode("com.apple.mobile.lockdown".into()))
        );
    }

    #[test]
    fn test_serves_requests_until_success_status() -> Result<()> {
        let (mut bundle, ticket, session) = dispatcher_parts();

        let link = ScriptedLink::new(
            RESTORED_SERVICE_TYPE,
            vec![
                Ok(Some(progress_msg(10, 5))),
                Ok(Some(request_msg(data_type::SYSTEM_IMAGE))),
                Ok(Some(request_msg(data_type::KERNEL_CACHE))),
                Ok(Some(request_msg(data_type::NOR))),
                Ok(Some(status_msg(0))),
            ],
        );
        let sent = link.sent();
        let streamer = RecordingStreamer::default();
        let streamed = streamer.streamed();

        let mut dispatcher = Dispatcher::new(
            Box::new(link),
            Box::new(streamer),
            &mut bundle,
            &ticket,
            &session,
            "image.dmg".into(),
        );
        dispatcher.run()?;

        assert!(session.shared.quit());
        assert_eq!(
            streamed.lock().unwrap().as_slice(),
            [std::path::PathBuf::from("image.dmg")]
        );

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);

        // kernelcache reply carries the re-signed container
        let kernel = sent[0].as_dictionary().unwrap();
        let bytes = kernel.get("KernelCacheFile").and_then(Value::as_data).unwrap();
        let blob = ticket.find(Selector::Name(name::KERNEL_CACHE))?.blob;
        assert_eq!(Img3::parse(bytes)?.signature(), Some(blob.as_slice()));

        // NOR reply: LLB plus the other all_flash entries, in ticket order
        let nor = sent[1].as_dictionary().unwrap();
        assert!(nor.get("LlbImageData").and_then(Value::as_data).is_some());
        let images = nor.get("NorImageData").and_then(Value::as_array).unwrap();
        assert_eq!(images.len(), 3);

        Ok(())
    }

    #[test]
    fn test_failure_status_is_an_error() {
        let (mut bundle, ticket, session) = dispatcher_parts();
        let link = ScriptedLink::new(RESTORED_SERVICE_TYPE, vec![Ok(Some(status_msg(6)))]);
        let streamer = RecordingStreamer::default();

        let mut dispatcher = Dispatcher::new(
            Box::new(link),
            Box::new(streamer),
            &mut bundle,
            &ticket,
            &session,
            "image.dmg".into(),
        );

        assert!(matches!(
            dispatcher.run(),
            Err(Error::Transport { stage: "restore-protocol", .. })
        ));
        assert!(session.shared.quit());
    }

    #[test]
    fn test_unknown_data_type_is_terminal() {
        let (mut bundle, ticket, session) = dispatcher_parts();
        let link = ScriptedLink::new(
            RESTORED_SERVICE_TYPE,
            vec![Ok(Some(request_msg("Unicorn")))],
        );
        let streamer = RecordingStreamer::default();

        let mut dispatcher = Dispatcher::new(
            Box::new(link),
            Box::new(streamer),
            &mut bundle,
            &ticket,
            &session,
            "image.dmg".into(),
        );

        assert_eq!(dispatcher.run(), Err(Error::UnknownDataType("Unicorn".into())));
    }

    #[test]
    fn test_receive_errors_are_tolerated_up_to_the_bound() -> Result<()> {
        let (mut bundle, ticket, session) = dispatcher_parts();

        let flaky = || Err(Error::transport("restore-protocol", "retransmit"));
        let link = ScriptedLink::new(
            RESTORED_SERVICE_TYPE,
            vec![
                flaky(),
                flaky(),
                flaky(),
                flaky(),
                // the counter resets on any good message
                Ok(Some(progress_msg(10, 50))),
                flaky(),
                Ok(None),
            ],
        );
        let streamer = RecordingStreamer::default();

        let mut dispatcher = Dispatcher::new(
            Box::new(link),
            Box::new(streamer),
            &mut bundle,
            &ticket,
            &session,
            "image.dmg".into(),
        );

        dispatcher.run()
    }

    #[test]
    fn test_sustained_receive_failures_terminate() {
        let (mut bundle, ticket, session) = dispatcher_parts();

        let script = (0..MAX_RECEIVE_FAILURES)
            .map(|_| Err(Error::transport("restore-protocol", "retransmit")))
            .collect();
        let link = ScriptedLink::new(RESTORED_SERVICE_TYPE, script);
        let streamer = RecordingStreamer::default();

        let mut dispatcher = Dispatcher::new(
            Box::new(link),
            Box::new(streamer),
            &mut bundle,
            &ticket,
            &session,
            "image.dmg".into(),
        );

        assert!(matches!(
            dispatcher.run(),
            Err(Error::Transport { stage: "restore-protocol", .. })
        ));
    }
}
