use liblinkwatch::{
    media_name, ConsumerToken, EventSink, L3Host, LinkInfo, Neighbor, Service, WirelessEvent,
};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Headless consumer: one JSON object per line for each event
pub struct JsonLines {
    out: Mutex<Box<dyn Write + Send>>,
    next_token: AtomicU64,
}

impl JsonLines {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        JsonLines {
            out: Mutex::new(out),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn stdout() -> Self {
        JsonLines::new(Box::new(io::stdout()))
    }

    pub fn emit(&self, v: &Value) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{}", v) {
            debug!("couldn't write event: {}", e);
        }
    }
}

impl EventSink for JsonLines {
    fn neighbor_observed(&self, link: &LinkInfo, neighbor: &Neighbor) -> Option<ConsumerToken> {
        self.emit(&json!({
            "event": "neighbor",
            "interface": link.name,
            "hwaddr": neighbor.addr,
            "name": neighbor.name,
            "device": neighbor.devname,
        }));
        // keep the token of a known entry
        neighbor
            .token
            .or_else(|| Some(self.next_token.fetch_add(1, Ordering::Relaxed)))
    }

    fn address_observed(&self, link: &LinkInfo, host: &L3Host) {
        self.emit(&json!({
            "event": "address",
            "interface": link.name,
            "addr": host.addr,
            "hwaddr": host.neighbor,
        }));
    }

    fn service_observed(&self, link: &LinkInfo, service: &Service) {
        self.emit(&json!({
            "event": "service",
            "interface": link.name,
            "addr": service.addr,
            "proto": service.proto,
            "port": service.port,
        }));
    }

    fn interface_added(&self, link: &LinkInfo) {
        self.emit(&json!({
            "event": "interface_added",
            "index": link.index,
            "interface": link.name,
            "media": media_name(link.arptype),
            "hwaddr": link.hwaddr,
            "mtu": link.mtu,
        }));
    }

    fn interface_removed(&self, link: &LinkInfo) {
        self.emit(&json!({
            "event": "interface_removed",
            "index": link.index,
            "interface": link.name,
        }));
    }

    fn wireless_event(&self, link: &LinkInfo, event: &WirelessEvent) {
        self.emit(&json!({
            "event": "wireless",
            "interface": link.name,
            "kind": event.kind,
            "cmd": event.cmd,
        }));
    }

    fn diagnostic(&self, msg: &str) {
        self.emit(&json!({
            "event": "diagnostic",
            "message": msg,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn one_line_per_event() {
        let buf = Shared::default();
        let sink = JsonLines::new(Box::new(buf.clone()));
        let link = LinkInfo {
            index: 2,
            name: "eth0".to_owned(),
            ..LinkInfo::default()
        };
        sink.interface_added(&link);
        sink.diagnostic("something odd");
        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "interface_added");
        assert_eq!(lines[0]["interface"], "eth0");
        assert_eq!(lines[1]["message"], "something odd");
    }
}
