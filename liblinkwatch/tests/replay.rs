use liblinkwatch::liblinkwatch_tools::{CaptureFileEngine, Config, Duration, Linktype, PcapWriter};
use liblinkwatch::*;
use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    diagnostics: Mutex<Vec<String>>,
    neighbors: Mutex<Vec<HwAddr>>,
    services: Mutex<Vec<Service>>,
    interfaces: Mutex<Vec<String>>,
}

impl EventSink for Recorder {
    fn neighbor_observed(&self, _link: &LinkInfo, neighbor: &Neighbor) -> Option<ConsumerToken> {
        let mut v = self.neighbors.lock().unwrap();
        v.push(neighbor.addr);
        Some(v.len() as u64)
    }
    fn service_observed(&self, _link: &LinkInfo, service: &Service) {
        self.services.lock().unwrap().push(*service);
    }
    fn interface_added(&self, link: &LinkInfo) {
        self.interfaces.lock().unwrap().push(link.name.clone());
    }
    fn diagnostic(&self, msg: &str) {
        self.diagnostics.lock().unwrap().push(msg.to_owned());
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture(linktype: Linktype, frames: &[(Vec<u8>, usize)]) -> Vec<u8> {
    let mut w = PcapWriter::new(Vec::new());
    w.init_file(65535, linktype).unwrap();
    for (i, (data, origlen)) in frames.iter().enumerate() {
        w.write_frame(Duration::new(1_600_000_000, i as u32 * 1000), data, *origlen)
            .unwrap();
    }
    w.into_inner()
}

fn replay(ctx: Arc<ObserverContext>, file: Vec<u8>) -> Vec<u32> {
    let analyzer = ReplayAnalyzer::new(ctx, "test.pcap", 1);
    let mut engine = CaptureFileEngine::new(analyzer, &Config::default());
    engine.run(&mut Cursor::new(file)).expect("replay failed");
    engine.into_analyzer().indices()
}

fn context(events: Arc<Recorder>) -> ObserverContext {
    ObserverContext::new(&Config::default(), events).with_resolver_conf(None)
}

fn eth_header(ethertype: u16) -> Vec<u8> {
    let mut f = vec![0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
    f.extend_from_slice(&[0x00, 0x50, 0x56, 0x01, 0x02, 0x03]);
    f.extend_from_slice(&ethertype.to_be_bytes());
    f
}

fn counters(ctx: &ObserverContext, index: u32) -> Counters {
    let iface = ctx.interfaces.get(index).unwrap();
    let state = iface.lock();
    state.counters
}

#[test]
fn unknown_ethertype_is_unclassified() {
    let rec = Arc::new(Recorder::default());
    let ctx = Arc::new(context(rec.clone()));
    let mut frame = eth_header(0x88b5);
    frame.resize(14 + 46, 0);
    let file = capture(Linktype::ETHERNET, &[(frame.clone(), frame.len())]);
    let indices = replay(ctx.clone(), file);
    assert_eq!(indices, vec![1]);
    let c = counters(&ctx, 1);
    assert_eq!(c.frames, 1);
    assert_eq!(c.noprotocol, 1);
    assert_eq!(c.malformed, 0);
    assert_eq!(c.truncated, 0);
    assert_eq!(rec.interfaces.lock().unwrap().as_slice(), &["test.pcap".to_owned()]);
    // broadcast destination and VMware source
    let iface = ctx.interfaces.get(1).unwrap();
    let state = iface.lock();
    let devices: Vec<Option<String>> = state.neighbors.iter().map(|n| n.devname.clone()).collect();
    assert_eq!(devices.len(), 2);
    assert!(devices.contains(&Some("Link broadcast".to_owned())));
    assert!(devices.contains(&Some("VMware".to_owned())));
}

#[test]
fn short_ipv4_total_length_is_malformed() {
    let rec = Arc::new(Recorder::default());
    let ctx = Arc::new(context(rec.clone()));
    let mut frame = eth_header(0x0800);
    frame.extend_from_slice(&[0x45, 0, 0, 19, 0, 0, 0, 0, 64, 6, 0, 0]);
    frame.extend_from_slice(&[192, 0, 2, 1, 192, 0, 2, 2]);
    let file = capture(Linktype::ETHERNET, &[(frame.clone(), frame.len())]);
    replay(ctx.clone(), file);
    let c = counters(&ctx, 1);
    assert_eq!(c.malformed, 1);
    assert_eq!(c.noprotocol, 0);
    assert!(!rec.diagnostics.lock().unwrap().is_empty());
    // never reached the address table
    assert_eq!(ctx.resolution.len(), 0);
}

fn ipv6_header(payload_len: u16, next: u8) -> Vec<u8> {
    let mut h = vec![0x60, 0, 0, 0];
    h.extend_from_slice(&payload_len.to_be_bytes());
    h.extend_from_slice(&[next, 64]);
    let mut src = [0u8; 16];
    src[..4].copy_from_slice(&[0x20, 0x01, 0x0d, 0xb8]);
    let mut dst = src;
    src[15] = 1;
    dst[15] = 2;
    h.extend_from_slice(&src);
    h.extend_from_slice(&dst);
    h
}

fn has_diagnostic(rec: &Recorder, needle: &str) -> bool {
    rec.diagnostics.lock().unwrap().iter().any(|d| d.contains(needle))
}

#[test]
fn ipv4_header_longer_than_capture_is_malformed() {
    let rec = Arc::new(Recorder::default());
    let ctx = Arc::new(context(rec.clone()));
    let mut frame = eth_header(0x0800);
    // IHL of 15 words, only the fixed 20 bytes present
    frame.extend_from_slice(&[0x4f, 0, 0, 20, 0, 0, 0, 0, 64, 17, 0, 0]);
    frame.extend_from_slice(&[192, 0, 2, 1, 192, 0, 2, 2]);
    frame.resize(60, 0);
    let file = capture(Linktype::ETHERNET, &[(frame.clone(), frame.len())]);
    replay(ctx.clone(), file);
    let c = counters(&ctx, 1);
    assert_eq!(c.malformed, 1);
    assert_eq!(c.noprotocol, 0);
    assert!(has_diagnostic(&rec, "IPv4 header length 60 with 46 bytes"));
    assert_eq!(ctx.resolution.len(), 0);
}

#[test]
fn ipv6_hop_by_hop_overflow_is_malformed() {
    let rec = Arc::new(Recorder::default());
    let ctx = Arc::new(context(rec.clone()));
    let mut frame = eth_header(0x86dd);
    frame.extend_from_slice(&ipv6_header(8, 0));
    // declares 16 bytes of options, 8 present
    frame.extend_from_slice(&[17, 1, 0, 0, 0, 0, 0, 0]);
    let file = capture(Linktype::ETHERNET, &[(frame.clone(), frame.len())]);
    replay(ctx.clone(), file);
    let c = counters(&ctx, 1);
    assert_eq!(c.malformed, 1);
    assert_eq!(c.noprotocol, 0);
    assert!(has_diagnostic(&rec, "IPv6 hop-by-hop length 16 with 8 bytes"));
    assert!(rec.services.lock().unwrap().is_empty());
}

#[test]
fn ipv6_fragment_after_hop_by_hop_is_not_reassembled() {
    let rec = Arc::new(Recorder::default());
    let ctx = Arc::new(context(rec.clone()));
    let mut frame = eth_header(0x86dd);
    frame.extend_from_slice(&ipv6_header(24, 0));
    // hop-by-hop naming a fragment header
    frame.extend_from_slice(&[44, 0, 1, 4, 0, 0, 0, 0]);
    // first fragment of a UDP datagram from port 53, more fragments
    frame.extend_from_slice(&[17, 0, 0, 1, 0, 0, 0, 7]);
    frame.extend_from_slice(&[0, 53, 0x80, 0, 0, 8, 0, 0]);
    let file = capture(Linktype::ETHERNET, &[(frame.clone(), frame.len())]);
    replay(ctx.clone(), file);
    let c = counters(&ctx, 1);
    assert_eq!(c.malformed, 0);
    assert_eq!(c.noprotocol, 1);
    assert!(has_diagnostic(&rec, "IP protocol 44"));
    assert!(rec.services.lock().unwrap().is_empty());
}

#[test]
fn truncated_frames_are_counted_and_skipped() {
    let rec = Arc::new(Recorder::default());
    let ctx = Arc::new(context(rec.clone()));
    let mut frame = eth_header(0x88b5);
    frame.resize(60, 0);
    let file = capture(Linktype::ETHERNET, &[(frame.clone(), 1514), (frame.clone(), 60)]);
    replay(ctx.clone(), file);
    let c = counters(&ctx, 1);
    assert_eq!(c.frames, 2);
    assert_eq!(c.truncated, 1);
    assert_eq!(c.noprotocol, 1);
    assert_eq!(c.bytes, 60);
}

#[test]
fn unhandled_linktype_fails_replay() {
    let ctx = Arc::new(context(Arc::new(Recorder::default())));
    let file = capture(Linktype::NULL, &[(vec![0; 20], 20)]);
    let analyzer = ReplayAnalyzer::new(ctx.clone(), "null.pcap", 1);
    let mut engine = CaptureFileEngine::new(analyzer, &Config::default());
    assert!(engine.run(&mut Cursor::new(file)).is_err());
    assert!(ctx.interfaces.is_empty());
}

#[test]
fn udp_service_and_arp_naming() {
    let rec = Arc::new(Recorder::default());
    let ctx = Arc::new(context(rec.clone()));
    // ARP reply from 02:00:00:00:00:07 (10.0.0.7)
    let mut arp = vec![0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 7, 0x08, 0x06];
    arp.extend_from_slice(&[0, 1, 0x08, 0x00, 6, 4, 0, 2]);
    arp.extend_from_slice(&[0x02, 0, 0, 0, 0, 7, 10, 0, 0, 7]);
    arp.extend_from_slice(&[0x02, 0, 0, 0, 0, 1, 10, 0, 0, 1]);
    arp.resize(60, 0);
    // DNS answer from 10.0.0.7
    let mut udp = vec![0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 7, 0x08, 0x00];
    udp.extend_from_slice(&[0x45, 0, 0, 28, 0, 0, 0, 0, 64, 17, 0, 0]);
    udp.extend_from_slice(&[10, 0, 0, 7, 10, 0, 0, 1]);
    udp.extend_from_slice(&[0, 53, 0xc0, 0x01, 0, 8, 0, 0]);
    let file = capture(
        Linktype::ETHERNET,
        &[(arp.clone(), arp.len()), (udp.clone(), udp.len())],
    );
    replay(ctx.clone(), file);
    let c = counters(&ctx, 1);
    assert_eq!(c.malformed, 0);
    assert_eq!(c.noprotocol, 0);
    let services = rec.services.lock().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].port, 53);
    assert_eq!(services[0].proto, 17);

    let iface = ctx.interfaces.get(1).unwrap();
    let state = iface.lock();
    let peer = HwAddr::new(&[0x02, 0, 0, 0, 0, 7]).unwrap();
    let n = state.neighbors.get(&peer).unwrap();
    assert_eq!(n.name.as_deref(), Some("10.0.0.7"));
    assert_eq!(n.srcpkt, 2);
    // most recently seen first
    assert_eq!(state.neighbors.iter().next().map(|n| n.addr), Some(peer));
}

#[test]
fn interesting_frames_are_relogged() {
    let rec = Arc::new(Recorder::default());
    let out = SharedBuf::default();
    let logger = FrameLogger::new(Box::new(out.clone())).unwrap();
    let ctx = Arc::new(context(rec).with_logger(logger));
    let mut bad = eth_header(0x88b5);
    bad.resize(60, 0);
    let mut good = eth_header(0x0800);
    // experimental IP protocol 253
    good.extend_from_slice(&[0x45, 0, 0, 20, 0, 0, 0, 0, 64, 253, 0, 0]);
    good.extend_from_slice(&[192, 0, 2, 1, 192, 0, 2, 2]);
    let file = capture(Linktype::ETHERNET, &[(bad.clone(), 60), (good.clone(), good.len())]);
    replay(ctx.clone(), file);
    let c = counters(&ctx, 1);
    assert_eq!(c.noprotocol, 2);
    assert_eq!(ctx.logger().unwrap().frames(), 2);
    let written = out.0.lock().unwrap();
    // pcap header + (record header + cooked header + payload) x 2
    assert_eq!(written.len(), 24 + (16 + 16 + 46) + (16 + 16 + 20));
}

#[test]
fn cooked_capture_synthesizes_addressing() {
    let rec = Arc::new(Recorder::default());
    let ctx = Arc::new(context(rec.clone()));
    let hdr = SllHeader {
        pkttype: PACKET_HOST,
        arphrd: ARPHRD_ETHER,
        halen: 6,
        addr: [0x02, 0, 0, 0, 0, 9, 0, 0],
        proto: 0x88b5,
    };
    let mut frame = hdr.to_bytes().to_vec();
    frame.extend_from_slice(&[0; 10]);
    let file = capture(Linktype::LINUX_SLL, &[(frame.clone(), frame.len())]);
    replay(ctx.clone(), file);
    let iface = ctx.interfaces.get(1).unwrap();
    let state = iface.lock();
    assert_eq!(state.counters.noprotocol, 1);
    assert_eq!(state.neighbors.len(), 1);
    // interface addressing is restored after each frame
    assert!(state.link.hwaddr.is_none());
}
