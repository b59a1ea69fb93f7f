//! Wireless extension events, as carried in `IFLA_WIRELESS` link attributes

use crate::events::EventSink;
use crate::interface::{InterfaceState, MediaSettings, WirelessSettings};
use serde::Serialize;

pub const SIOCSIWFREQ: u16 = 0x8B04;
pub const SIOCSIWMODE: u16 = 0x8B06;
pub const SIOCGIWSPY: u16 = 0x8B11;
pub const SIOCGIWAP: u16 = 0x8B15;
pub const SIOCGIWSCAN: u16 = 0x8B19;
pub const SIOCSIWESSID: u16 = 0x8B1A;
pub const SIOCSIWRATE: u16 = 0x8B20;
pub const SIOCSIWTXPOW: u16 = 0x8B26;
pub const IWEVASSOCRESPIE: u16 = 0x8C09;

/// Packed event header: length and command, native endian
pub const IW_EV_LCP_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum WirelessEventKind {
    Scan,
    AccessPoint,
    Spy,
    Mode,
    Frequency,
    AssocRespIe,
    Essid,
    Bitrate,
    TxPower,
}

impl WirelessEventKind {
    pub fn from_cmd(cmd: u16) -> Option<WirelessEventKind> {
        let kind = match cmd {
            SIOCGIWSCAN => WirelessEventKind::Scan,
            SIOCGIWAP => WirelessEventKind::AccessPoint,
            SIOCGIWSPY => WirelessEventKind::Spy,
            SIOCSIWMODE => WirelessEventKind::Mode,
            SIOCSIWFREQ => WirelessEventKind::Frequency,
            IWEVASSOCRESPIE => WirelessEventKind::AssocRespIe,
            SIOCSIWESSID => WirelessEventKind::Essid,
            SIOCSIWRATE => WirelessEventKind::Bitrate,
            SIOCSIWTXPOW => WirelessEventKind::TxPower,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WirelessEvent {
    pub cmd: u16,
    pub kind: WirelessEventKind,
}

fn read_u32(b: &[u8], off: usize) -> Option<u32> {
    let b = b.get(off..off + 4)?;
    Some(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

/// Dispatch one wireless event for an interface.
///
/// The interface becomes wireless if it was not already. Mode, frequency and
/// bit rate are recorded when the payload carries them.
pub fn handle_wireless_event(
    state: &mut InterfaceState,
    payload: &[u8],
    events: &dyn EventSink,
) -> Option<WirelessEvent> {
    if payload.len() < IW_EV_LCP_LEN {
        let msg = format!(
            "wireless message too short on {} ({})",
            state.link.name,
            payload.len()
        );
        warn!("{}", msg);
        events.diagnostic(&msg);
        return None;
    }
    let cmd = u16::from_ne_bytes([payload[2], payload[3]]);
    let kind = match WirelessEventKind::from_cmd(cmd) {
        Some(k) => k,
        None => {
            let msg = format!("unknown wireless event on {}: 0x{:04x}", state.link.name, cmd);
            warn!("{}", msg);
            events.diagnostic(&msg);
            return None;
        }
    };
    if !matches!(state.settings, MediaSettings::Wireless(_)) {
        state.settings = MediaSettings::Wireless(WirelessSettings::default());
    }
    if let MediaSettings::Wireless(ref mut w) = state.settings {
        let data = &payload[IW_EV_LCP_LEN..];
        match kind {
            WirelessEventKind::Mode => {
                if let Some(mode) = read_u32(data, 0) {
                    w.mode = mode;
                }
            }
            WirelessEventKind::Frequency => {
                // struct iw_freq: mantissa (i32), exponent (i16)
                if let (Some(m), Some(e)) = (read_u32(data, 0), data.get(4..6)) {
                    let m = m as i32;
                    let e = i16::from_ne_bytes([e[0], e[1]]);
                    if m >= 0 && (0..=9).contains(&e) {
                        w.frequency = (m as u64).saturating_mul(10u64.pow(e as u32));
                    } else if m >= 0 {
                        // channel number
                        w.frequency = m as u64;
                    }
                }
            }
            WirelessEventKind::Bitrate => {
                if let Some(rate) = read_u32(data, 0) {
                    w.bitrate = rate;
                }
            }
            _ => (),
        }
        w.last_event = Some(cmd);
    }
    let event = WirelessEvent { cmd, kind };
    debug!("wireless event {:?} on {}", kind, state.link.name);
    events.wireless_event(&state.link, &event);
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<WirelessEvent>>,
        diags: Mutex<Vec<String>>,
    }

    impl EventSink for Recorder {
        fn wireless_event(&self, _link: &crate::interface::LinkInfo, event: &WirelessEvent) {
            self.events.lock().unwrap().push(*event);
        }
        fn diagnostic(&self, msg: &str) {
            self.diags.lock().unwrap().push(msg.to_owned());
        }
    }

    fn event(cmd: u16, data: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&((IW_EV_LCP_LEN + data.len()) as u16).to_ne_bytes());
        v.extend_from_slice(&cmd.to_ne_bytes());
        v.extend_from_slice(data);
        v
    }

    #[test]
    fn wireless_frequency_and_mode() {
        let mut state = InterfaceState::new(3, 16);
        let mut freq = Vec::new();
        freq.extend_from_slice(&2412i32.to_ne_bytes());
        freq.extend_from_slice(&6i16.to_ne_bytes());
        freq.extend_from_slice(&[0, 0]);
        let ev = handle_wireless_event(&mut state, &event(SIOCSIWFREQ, &freq), &NullSink).unwrap();
        assert_eq!(ev.kind, WirelessEventKind::Frequency);
        handle_wireless_event(&mut state, &event(SIOCSIWMODE, &2u32.to_ne_bytes()), &NullSink);
        match state.settings {
            MediaSettings::Wireless(ref w) => {
                assert_eq!(w.frequency, 2_412_000_000);
                assert_eq!(w.mode, 2);
                assert_eq!(w.last_event, Some(SIOCSIWMODE));
            }
            _ => panic!("interface should be wireless"),
        }
    }

    #[test]
    fn wireless_unknown_and_short() {
        let rec = Recorder::default();
        let mut state = InterfaceState::new(3, 16);
        assert!(handle_wireless_event(&mut state, &[0, 0], &rec).is_none());
        assert!(handle_wireless_event(&mut state, &event(0x8B00, &[]), &rec).is_none());
        assert!(handle_wireless_event(&mut state, &event(SIOCGIWSCAN, &[]), &rec).is_some());
        assert_eq!(rec.diags.lock().unwrap().len(), 2);
        assert_eq!(rec.events.lock().unwrap().len(), 1);
        assert_eq!(state.settings, MediaSettings::Wireless(WirelessSettings {
            last_event: Some(SIOCGIWSCAN),
            ..WirelessSettings::default()
        }));
    }
}
