//! usbmux-based transports: normal mode, restore mode, and the ASR
//! filesystem stream.
//!
//! Devices in normal and restore mode enumerate through the usbmux
//! daemon rather than as raw USB. The daemon speaks a tagged plist
//! protocol on its unix socket; a successful `Connect` turns the socket
//! into a raw pipe to a TCP port on the device, over which the lockdown,
//! restored and ASR services each speak length-prefixed XML plists (ASR
//! sends bare plists).

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use log::{debug, info, trace, warn};
use plist::{Dictionary, Value};

use crate::props::{as_u64, dict_get};
use crate::transport::{ImageStreamer, NormalLink, RestoreLink};
use crate::{Error, Result};

/// The usbmux daemon's socket.
pub const USBMUXD_SOCKET: &str = "/var/run/usbmuxd";

/// Device port of the lockdown service (restored in restore mode).
pub const LOCKDOWN_PORT: u16 = 62078;

/// Device port of the ASR filesystem-restore agent.
pub const ASR_PORT: u16 = 12345;

/// usbmux packet payload kind: XML plist.
const MUX_PLIST: u32 = 8;
const MUX_VERSION: u32 = 1;
const MUX_HEADER: usize = 16;

/// Upper bound on a single service message, as a hedge against reading
/// a garbage length prefix.
const MAX_MESSAGE: usize = 16 * 1024 * 1024;

fn mux_error(err: std::io::Error) -> Error {
    Error::transport("usbmux", format!("{err}"))
}

/// A connection to the usbmux daemon.
struct MuxSocket {
    stream: UnixStream,
    tag: u32,
}

impl MuxSocket {
    fn connect() -> Result<Self> {
        let stream = UnixStream::connect(USBMUXD_SOCKET).map_err(mux_error)?;

        Ok(Self { stream, tag: 0 })
    }

    /// Send one request and read the daemon's tagged reply.
    fn request(&mut self, message: &str, extra: Dictionary) -> Result<Dictionary> {
        let mut payload = extra;
        payload.insert("MessageType".into(), Value::String(message.into()));
        payload.insert("ProgName".into(), Value::String("ipswrestore".into()));
        payload.insert("ClientVersionString".into(), Value::String("ipswrestore".into()));

        let mut xml = Vec::new();
        Value::Dictionary(payload)
            .to_writer_xml(&mut xml)
            .map_err(|err| Error::transport("usbmux", format!("encode: {err}")))?;

        self.tag += 1;
        let mut packet = Vec::with_capacity(MUX_HEADER + xml.len());
        packet.extend_from_slice(&((MUX_HEADER + xml.len()) as u32).to_le_bytes());
        packet.extend_from_slice(&MUX_VERSION.to_le_bytes());
        packet.extend_from_slice(&MUX_PLIST.to_le_bytes());
        packet.extend_from_slice(&self.tag.to_le_bytes());
        packet.extend_from_slice(&xml);

        self.stream.write_all(&packet).map_err(mux_error)?;

        let mut header = [0u8; MUX_HEADER];
        self.stream.read_exact(&mut header).map_err(mux_error)?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if !(MUX_HEADER..=MAX_MESSAGE).contains(&length) {
            return Err(Error::transport("usbmux", format!("bad packet length {length}")));
        }

        let mut body = vec![0u8; length - MUX_HEADER];
        self.stream.read_exact(&mut body).map_err(mux_error)?;

        let reply = Value::from_reader_xml(Cursor::new(body))
            .map_err(|err| Error::transport("usbmux", format!("decode: {err}")))?;
        let reply = reply
            .into_dictionary()
            .ok_or_else(|| Error::transport("usbmux", "reply is not a dict"))?;

        Ok(reply)
    }

    /// Turn this connection into a raw pipe to `port` on the device.
    fn connect_to_device(mut self, device_id: u64, port: u16) -> Result<UnixStream> {
        let mut extra = Dictionary::new();
        extra.insert("DeviceID".into(), Value::Integer(device_id.into()));
        // the daemon expects the port in network byte order
        extra.insert("PortNumber".into(), Value::Integer(u64::from(port.swap_bytes()).into()));

        let reply = self.request("Connect", extra)?;
        let number = as_u64(dict_get(&reply, "Number", "usbmux Connect reply")?, "usbmux Number")?;
        if number != 0 {
            return Err(Error::transport(
                "usbmux",
                format!("connect to device port {port} refused: {number}"),
            ));
        }

        trace!("usbmux pipe open to device {device_id} port {port}");

        Ok(self.stream)
    }
}

/// A usbmux-visible device.
#[derive(Clone, Debug, PartialEq)]
pub struct MuxDevice {
    pub device_id: u64,
    pub serial: String,
}

/// List devices currently attached through the daemon.
pub fn list_devices() -> Result<Vec<MuxDevice>> {
    let mut mux = MuxSocket::connect()?;
    let reply = mux.request("ListDevices", Dictionary::new())?;

    let list = dict_get(&reply, "DeviceList", "usbmux ListDevices reply")?
        .as_array()
        .ok_or_else(|| Error::transport("usbmux", "DeviceList is not an array"))?;

    let mut devices = Vec::with_capacity(list.len());
    for node in list {
        let Some(record) = node.as_dictionary() else {
            continue;
        };
        let Some(device_id) = record.get("DeviceID").and_then(Value::as_unsigned_integer) else {
            continue;
        };
        let serial = record
            .get("Properties")
            .and_then(Value::as_dictionary)
            .and_then(|props| props.get("SerialNumber"))
            .and_then(Value::as_string)
            .unwrap_or_default()
            .to_string();

        devices.push(MuxDevice { device_id, serial });
    }

    debug!("usbmux reports {} device(s)", devices.len());

    Ok(devices)
}

/// Open a raw pipe to a TCP port on the given device.
pub fn connect_device(device_id: u64, port: u16) -> Result<UnixStream> {
    MuxSocket::connect()?.connect_to_device(device_id, port)
}

/// Length-prefixed plist framing used by the lockdown and restored
/// services: 32-bit big-endian byte count, then one XML plist.
pub struct ServiceStream<S: Read + Write = UnixStream> {
    stream: S,
    stage: &'static str,
}

impl<S: Read + Write> ServiceStream<S> {
    pub fn new(stream: S, stage: &'static str) -> Self {
        Self { stream, stage }
    }

    fn fail(&self, err: std::io::Error) -> Error {
        Error::transport(self.stage, format!("{err}"))
    }

    /// Send one message.
    pub fn send(&mut self, msg: &Value) -> Result<()> {
        let mut xml = Vec::new();
        msg.to_writer_xml(&mut xml)
            .map_err(|err| Error::transport(self.stage, format!("encode: {err}")))?;

        self.stream
            .write_all(&(xml.len() as u32).to_be_bytes())
            .map_err(|err| self.fail(err))?;
        self.stream.write_all(&xml).map_err(|err| self.fail(err))?;

        Ok(())
    }

    /// Receive one message; `Ok(None)` when the peer closed cleanly.
    pub fn receive(&mut self) -> Result<Option<Value>> {
        let mut prefix = [0u8; 4];
        match self.stream.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(self.fail(err)),
        }

        let length = u32::from_be_bytes(prefix) as usize;
        if length == 0 || length > MAX_MESSAGE {
            return Err(Error::transport(self.stage, format!("bad message length {length}")));
        }

        let mut body = vec![0u8; length];
        self.stream.read_exact(&mut body).map_err(|err| self.fail(err))?;

        let msg = Value::from_reader_xml(Cursor::new(body))
            .map_err(|err| Error::transport(self.stage, format!("decode: {err}")))?;

        Ok(Some(msg))
    }

    /// Send and wait for the matching reply.
    pub fn exchange(&mut self, msg: &Value) -> Result<Value> {
        self.send(msg)?;
        self.receive()?
            .ok_or_else(|| Error::transport(self.stage, "peer closed during exchange"))
    }
}

/// Lockdown client on a normal-mode device.
pub struct LockdownClient {
    svc: ServiceStream,
}

impl LockdownClient {
    /// Connect to lockdown on the given usbmux device.
    pub fn open(device_id: u64) -> Result<Self> {
        let stream = connect_device(device_id, LOCKDOWN_PORT)?;
        let mut client = Self {
            svc: ServiceStream::new(stream, "lockdown"),
        };

        let ty = client.query_type()?;
        if ty != "com.apple.mobile.lockdown" {
            return Err(Error::transport("lockdown", format!("unexpected service type {ty}")));
        }

        Ok(client)
    }

    fn request(&mut self, request: &str, extra: Dictionary) -> Result<Dictionary> {
        let mut msg = extra;
        msg.insert("Request".into(), Value::String(request.into()));
        msg.insert("Label".into(), Value::String("ipswrestore".into()));

        let reply = self.svc.exchange(&Value::Dictionary(msg))?;
        let reply = reply
            .into_dictionary()
            .ok_or_else(|| Error::transport("lockdown", "reply is not a dict"))?;

        if let Some(error) = reply.get("Error").and_then(Value::as_string) {
            return Err(Error::transport("lockdown", format!("{request}: {error}")));
        }

        Ok(reply)
    }

    pub fn query_type(&mut self) -> Result<String> {
        let reply = self.request("QueryType", Dictionary::new())?;
        let ty = reply
            .get("Type")
            .and_then(Value::as_string)
            .unwrap_or_default();

        Ok(ty.into())
    }

    pub fn get_value(&mut self, key: &str) -> Result<Value> {
        let mut extra = Dictionary::new();
        extra.insert("Key".into(), Value::String(key.into()));

        let mut reply = self.request("GetValue", extra)?;
        reply
            .remove("Value")
            .ok_or_else(|| Error::transport("lockdown", format!("GetValue {key}: no value")))
    }
}

impl NormalLink for LockdownClient {
    fn unique_chip_id(&mut self) -> Result<u64> {
        let value = self
            .get_value("UniqueChipID")
            .map_err(|err| Error::IdentityUnavailable(format!("{err}")))?;

        value
            .as_unsigned_integer()
            .ok_or_else(|| Error::IdentityUnavailable("UniqueChipID is not an integer".into()))
    }

    fn enter_recovery(&mut self) -> Result<()> {
        info!("asking lockdown to enter recovery mode");

        // the device drops off the bus as it obeys, so a lost reply here
        // is expected
        let mut msg = Dictionary::new();
        msg.insert("Request".into(), Value::String("EnterRecovery".into()));
        msg.insert("Label".into(), Value::String("ipswrestore".into()));
        self.svc.send(&Value::Dictionary(msg))?;

        if let Ok(Some(reply)) = self.svc.receive() {
            if let Some(error) = reply
                .as_dictionary()
                .and_then(|reply| reply.get("Error"))
                .and_then(Value::as_string)
            {
                return Err(Error::transport("lockdown", format!("EnterRecovery: {error}")));
            }
        }

        Ok(())
    }
}

/// Client for the restored service on a restore-mode device.
pub struct RestoredClient {
    svc: ServiceStream,
}

impl RestoredClient {
    pub fn open(device_id: u64) -> Result<Self> {
        let stream = connect_device(device_id, LOCKDOWN_PORT)?;

        Ok(Self {
            svc: ServiceStream::new(stream, "restore-protocol"),
        })
    }
}

impl RestoreLink for RestoredClient {
    fn query_type(&mut self) -> Result<String> {
        let mut msg = Dictionary::new();
        msg.insert("Request".into(), Value::String("QueryType".into()));

        let reply = self.svc.exchange(&Value::Dictionary(msg))?;
        let ty = reply
            .as_dictionary()
            .and_then(|reply| reply.get("Type"))
            .and_then(Value::as_string)
            .unwrap_or_default();

        Ok(ty.into())
    }

    fn start_restore(&mut self) -> Result<()> {
        let mut msg = Dictionary::new();
        msg.insert("Request".into(), Value::String("StartRestore".into()));

        self.svc.send(&Value::Dictionary(msg))
    }

    fn receive(&mut self) -> Result<Option<Value>> {
        self.svc.receive()
    }

    fn send(&mut self, msg: &Value) -> Result<()> {
        self.svc.send(msg)
    }
}

/// ASR streamer: answers the device agent's image requests over a raw
/// usbmux pipe. ASR messages are bare XML plists, one per read.
pub struct AsrClient {
    stream: UnixStream,
}

impl AsrClient {
    pub fn open(device_id: u64) -> Result<Self> {
        let stream = connect_device(device_id, ASR_PORT)?;

        Ok(Self { stream })
    }

    fn receive(&mut self) -> Result<Dictionary> {
        let mut buf = vec![0u8; 65536];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|err| Error::transport("asr", format!("{err}")))?;
        if n == 0 {
            return Err(Error::transport("asr", "agent closed the stream"));
        }

        Value::from_reader_xml(Cursor::new(&buf[..n]))
            .map_err(|err| Error::transport("asr", format!("decode: {err}")))?
            .into_dictionary()
            .ok_or_else(|| Error::transport("asr", "message is not a dict"))
    }

    fn send(&mut self, msg: Dictionary) -> Result<()> {
        let mut xml = Vec::new();
        Value::Dictionary(msg)
            .to_writer_xml(&mut xml)
            .map_err(|err| Error::transport("asr", format!("encode: {err}")))?;

        self.stream
            .write_all(&xml)
            .map_err(|err| Error::transport("asr", format!("{err}")))
    }

    fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .map_err(|err| Error::transport("asr", format!("{err}")))
    }
}

impl ImageStreamer for AsrClient {
    fn stream(&mut self, image: &Path) -> Result<()> {
        let mut file = File::open(image)
            .map_err(|err| Error::Io(format!("{}: {err}", image.display())))?;
        let size = file.metadata().map_err(Error::from)?.len();

        info!("streaming filesystem image ({size} bytes)");

        let mut payload = Dictionary::new();
        payload.insert("Port".into(), Value::Integer(1u64.into()));
        payload.insert("Size".into(), Value::Integer(size.into()));

        let mut initiate = Dictionary::new();
        initiate.insert("FEC Slice Stride".into(), Value::Integer(40u64.into()));
        initiate.insert("Packet Payload Size".into(), Value::Integer(1450u64.into()));
        initiate.insert("Packets Per FEC".into(), Value::Integer(25u64.into()));
        initiate.insert("Payload".into(), Value::Dictionary(payload));
        initiate.insert("Stream ID".into(), Value::Integer(1u64.into()));
        initiate.insert("Version".into(), Value::Integer(1u64.into()));
        self.send(initiate)?;

        loop {
            let msg = self.receive()?;
            let command = msg
                .get("Command")
                .and_then(Value::as_string)
                .unwrap_or_default();

            match command {
                "OOBData" => {
                    let offset = msg
                        .get("OOB Offset")
                        .and_then(Value::as_unsigned_integer)
                        .ok_or_else(|| Error::transport("asr", "OOBData without offset"))?;
                    let length = msg
                        .get("OOB Length")
                        .and_then(Value::as_unsigned_integer)
                        .ok_or_else(|| Error::transport("asr", "OOBData without length"))?;

                    let mut oob = vec![0u8; length as usize];
                    file.seek(SeekFrom::Start(offset)).map_err(Error::from)?;
                    file.read_exact(&mut oob).map_err(Error::from)?;
                    self.send_raw(&oob)?;

                    trace!("asr OOB read: {length} bytes at {offset}");
                }
                "Payload" => {
                    file.seek(SeekFrom::Start(0)).map_err(Error::from)?;

                    let mut sent = 0u64;
                    let mut chunk = vec![0u8; 65536];
                    loop {
                        let n = file.read(&mut chunk).map_err(Error::from)?;
                        if n == 0 {
                            break;
                        }
                        self.send_raw(&chunk[..n])?;
                        sent += n as u64;
                    }

                    info!("filesystem image sent ({sent} bytes)");

                    return Ok(());
                }
                other => {
                    warn!("asr sent unknown command {other:?}");
                    return Err(Error::transport("asr", format!("unknown command {other}")));
                }
            }
        }
    }
}
