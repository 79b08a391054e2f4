#![allow(dead_code)]

use lightlink::discovery::{Advertisement, Browse, DiscoveryError, ServiceBrowser};
use lightlink::persistence::NetworkCredentials;
use lightlink::wifi::{DriverError, WifiDriver, WifiEvent, WifiEventSender};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const DEVICE_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

/// Radio that either always or never gets an address.
#[derive(Clone, Default)]
pub struct FakeDriver {
    pub calls: Arc<Mutex<Vec<&'static str>>>,
    link_up: bool,
    events: Option<WifiEventSender>,
    started: bool,
}

impl FakeDriver {
    pub fn online() -> Self {
        Self {
            link_up: true,
            ..Self::default()
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn emit(&self, event: WifiEvent) -> Result<(), DriverError> {
        self.events
            .as_ref()
            .ok_or(DriverError::NotInitialized)?
            .send(event)
            .map_err(|e| DriverError::Failure(e.to_string()))
    }
}

impl WifiDriver for FakeDriver {
    fn init(&mut self, events: WifiEventSender) -> Result<(), DriverError> {
        self.log("init");
        self.events = Some(events);
        Ok(())
    }

    fn set_credentials(&mut self, _: &NetworkCredentials) -> Result<(), DriverError> {
        self.log("set_credentials");
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.log("start");
        self.started = true;
        self.emit(WifiEvent::StaStart)
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        self.log("connect");
        if self.link_up {
            self.emit(WifiEvent::GotIp(DEVICE_ADDRESS))
        } else {
            self.emit(WifiEvent::StaDisconnected)
        }
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.log("disconnect");
        match (&self.events, self.started) {
            (None, _) => Err(DriverError::NotInitialized),
            (Some(_), false) => Err(DriverError::NotStarted),
            _ => Ok(()),
        }
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.log("stop");
        self.started = false;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), DriverError> {
        self.log("deinit");
        self.events = None;
        Ok(())
    }
}

/// Browser replaying advertisements, each after its delay.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    adverts: Vec<(Duration, Advertisement)>,
    pub closed: Arc<AtomicBool>,
}

impl FakeBrowser {
    pub fn new(adverts: Vec<(Duration, Advertisement)>) -> Self {
        Self {
            adverts,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn advert(address: [u8; 4], port: u16) -> Advertisement {
    Advertisement {
        instance: "broker._mqtt._tcp.local.".to_string(),
        host: "broker.local.".to_string(),
        addresses: vec![Ipv4Addr::from(address)],
        port,
    }
}

impl ServiceBrowser for FakeBrowser {
    fn browse(&self, _service_type: &str) -> Result<Browse, DiscoveryError> {
        let (tx, rx) = mpsc::channel(8);
        let adverts = self.adverts.clone();
        tokio::spawn(async move {
            for (at, advert) in adverts {
                tokio::time::sleep(at).await;
                if tx.send(advert).await.is_err() {
                    return;
                }
            }
            // Keep the query open until the caller gives up.
            tx.closed().await;
        });

        let closed = self.closed.clone();
        Ok(Browse::new(rx, move || closed.store(true, Ordering::SeqCst)))
    }
}

pub const CONNECT: u8 = 1;
pub const PUBLISH: u8 = 3;
pub const SUBSCRIBE: u8 = 8;
pub const PINGREQ: u8 = 12;
pub const DISCONNECT: u8 = 14;

/// Minimal MQTT 3.1.1 broker end, driven by the test.
pub struct FakeBroker {
    listener: TcpListener,
}

impl FakeBroker {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub fn uri(&self) -> String {
        format!("mqtt://127.0.0.1:{}/", self.port())
    }

    pub async fn accept(&self) -> BrokerConn {
        let (socket, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        BrokerConn { socket }
    }

    /// True if no client connects within `window`.
    pub async fn idle_for(&self, window: Duration) -> bool {
        tokio::time::timeout(window, self.listener.accept()).await.is_err()
    }
}

#[derive(Debug)]
pub struct Packet {
    pub kind: u8,
    pub flags: u8,
    pub body: Vec<u8>,
}

impl Packet {
    fn string_at(&self, offset: usize) -> (String, usize) {
        let len = u16::from_be_bytes([self.body[offset], self.body[offset + 1]]) as usize;
        let text = String::from_utf8(self.body[offset + 2..offset + 2 + len].to_vec()).unwrap();
        (text, offset + 2 + len)
    }

    fn qos(&self) -> u8 {
        (self.flags >> 1) & 0b11
    }

    pub fn topic(&self) -> String {
        match self.kind {
            PUBLISH => self.string_at(0).0,
            SUBSCRIBE => self.string_at(2).0,
            other => panic!("packet type {} has no topic", other),
        }
    }

    pub fn packet_id(&self) -> u16 {
        let offset = match self.kind {
            PUBLISH => self.string_at(0).1,
            _ => 0,
        };
        u16::from_be_bytes([self.body[offset], self.body[offset + 1]])
    }

    pub fn payload(&self) -> Vec<u8> {
        let (_, mut offset) = self.string_at(0);
        if self.qos() > 0 {
            offset += 2;
        }
        self.body[offset..].to_vec()
    }

    pub fn contains(&self, needle: &[u8]) -> bool {
        self.body.windows(needle.len()).any(|w| w == needle)
    }
}

pub struct BrokerConn {
    socket: TcpStream,
}

impl BrokerConn {
    /// Next packet, `None` once the client closed the connection.
    pub async fn read(&mut self) -> Option<Packet> {
        let header = self.socket.read_u8().await.ok()?;

        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = self.socket.read_u8().await.ok()?;
            remaining |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0u8; remaining];
        self.socket.read_exact(&mut body).await.ok()?;
        Some(Packet {
            kind: header >> 4,
            flags: header & 0x0f,
            body,
        })
    }

    /// Next packet other than a ping, which is answered on the way.
    pub async fn expect(&mut self, kind: u8) -> Packet {
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(5), self.read())
                .await
                .expect("no packet from client")
                .expect("client closed the connection");
            if packet.kind == PINGREQ {
                self.write(&[0xd0, 0x00]).await;
                continue;
            }
            assert_eq!(packet.kind, kind, "unexpected packet {:?}", packet);
            return packet;
        }
    }

    /// True if the client stays silent for `window`.
    pub async fn silent_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.read()).await.is_err()
    }

    pub async fn connack(&mut self) {
        self.write(&[0x20, 0x02, 0x00, 0x00]).await;
    }

    pub async fn puback(&mut self, id: u16) {
        let [hi, lo] = id.to_be_bytes();
        self.write(&[0x40, 0x02, hi, lo]).await;
    }

    pub async fn suback(&mut self, id: u16) {
        let [hi, lo] = id.to_be_bytes();
        self.write(&[0x90, 0x03, hi, lo, 0x01]).await;
    }

    /// QoS 0 publish towards the client.
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let mut packet = vec![0x30];
        let mut remaining = body.len();
        loop {
            let mut byte = (remaining % 128) as u8;
            remaining /= 128;
            if remaining > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if remaining == 0 {
                break;
            }
        }
        packet.extend_from_slice(&body);
        self.write(&packet).await;
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.socket.write_all(bytes).await.unwrap();
    }
}
