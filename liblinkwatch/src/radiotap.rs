//! radiotap and IEEE 802.11 framing (monitor-mode captures)

use crate::dissect::Dissector;

const RADIOTAP_MIN_LEN: usize = 8;
const RADIOTAP_PRESENT_EXT: u32 = 1 << 31;
const RADIOTAP_TSFT: u32 = 1 << 0;
const RADIOTAP_FLAGS: u32 = 1 << 1;
const RADIOTAP_F_FCS: u8 = 0x10;

const IEEE80211_HLEN: usize = 24;
const IEEE80211_FCS_LEN: usize = 4;

const FC_TYPE_MGMT: u8 = 0;
const FC_TYPE_CTRL: u8 = 1;
const FC_TYPE_DATA: u8 = 2;
const FC_SUBTYPE_QOS: u8 = 0x08;
const FC_SUBTYPE_NODATA: u8 = 0x04;
const FC_TO_DS: u8 = 0x01;
const FC_FROM_DS: u8 = 0x02;

/// radiotap header: total length, and whether frames carry a trailing FCS
pub fn parse_radiotap(data: &[u8]) -> Option<(usize, bool)> {
    if data.len() < RADIOTAP_MIN_LEN || data[0] != 0 {
        return None;
    }
    let len = usize::from(u16::from_le_bytes([data[2], data[3]]));
    if len < RADIOTAP_MIN_LEN || len > data.len() {
        return None;
    }
    let hdr = &data[..len];
    let present = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    // skip extended presence bitmaps
    let mut offset = 8;
    let mut word = present;
    while word & RADIOTAP_PRESENT_EXT != 0 {
        let next = hdr.get(offset..offset + 4)?;
        word = u32::from_le_bytes([next[0], next[1], next[2], next[3]]);
        offset += 4;
    }
    if present & RADIOTAP_TSFT != 0 {
        offset = (offset + 7) & !7;
        offset += 8;
    }
    let mut fcs = false;
    if present & RADIOTAP_FLAGS != 0 {
        let flags = *hdr.get(offset)?;
        fcs = flags & RADIOTAP_F_FCS != 0;
    }
    Some((len, fcs))
}

impl Dissector<'_> {
    pub(crate) fn handle_l2_radiotap(&mut self, data: &[u8]) {
        trace!("handle_l2_radiotap (len={})", data.len());
        let (rlen, fcs) = match parse_radiotap(data) {
            Some(r) => r,
            None => {
                self.pkt.l2hlen = data.len();
                self.malformed(format_args!("radiotap header with {} bytes", data.len()));
                return;
            }
        };
        let mut frame = &data[rlen..];
        if fcs {
            if frame.len() < IEEE80211_FCS_LEN {
                self.pkt.l2hlen = data.len();
                self.malformed(format_args!("802.11 FCS with {} bytes", frame.len()));
                return;
            }
            frame = &frame[..frame.len() - IEEE80211_FCS_LEN];
        }
        self.pkt.l2hlen = rlen;
        self.handle_l2_ieee80211(frame);
    }

    fn handle_l2_ieee80211(&mut self, data: &[u8]) {
        if data.len() < 10 {
            self.pkt.l2hlen += data.len();
            self.malformed(format_args!("802.11 frame with {} bytes", data.len()));
            return;
        }
        let fc = data[0];
        let flags = data[1];
        let ftype = (fc >> 2) & 0x3;
        let subtype = fc >> 4;
        match ftype {
            FC_TYPE_CTRL => {
                // receiver address only
                self.pkt.l2hlen += data.len();
                self.pkt.l2d = self.neighbor(&data[4..10]);
            }
            FC_TYPE_MGMT => {
                self.pkt.l2hlen += data.len();
                if data.len() < IEEE80211_HLEN {
                    self.malformed(format_args!("802.11 management with {} bytes", data.len()));
                    return;
                }
                self.pkt.l2d = self.neighbor(&data[4..10]);
                self.pkt.l2s = self.neighbor(&data[10..16]);
            }
            FC_TYPE_DATA => self.handle_l2_ieee80211_data(data, flags, subtype),
            _ => {
                self.pkt.l2hlen += data.len();
                self.noproto(format_args!("802.11 frame type {}", ftype));
            }
        }
    }

    fn handle_l2_ieee80211_data(&mut self, data: &[u8], flags: u8, subtype: u8) {
        let four_addr = flags & (FC_TO_DS | FC_FROM_DS) == (FC_TO_DS | FC_FROM_DS);
        let mut hlen = IEEE80211_HLEN;
        if four_addr {
            hlen += 6;
        }
        if subtype & FC_SUBTYPE_QOS != 0 {
            hlen += 2;
        }
        if data.len() < hlen {
            self.pkt.l2hlen += data.len();
            self.malformed(format_args!("802.11 data header {} with {} bytes", hlen, data.len()));
            return;
        }
        let addr1 = &data[4..10];
        let addr2 = &data[10..16];
        let addr3 = &data[16..22];
        let (dst, src) = match (flags & FC_TO_DS != 0, flags & FC_FROM_DS != 0) {
            (false, false) => (addr1, addr2),
            (false, true) => (addr1, addr3),
            (true, false) => (addr3, addr2),
            (true, true) => (addr3, &data[24..30]),
        };
        self.pkt.l2d = self.neighbor(dst);
        self.pkt.l2s = self.neighbor(src);
        self.pkt.l2hlen += hlen;
        if subtype & FC_SUBTYPE_NODATA != 0 {
            // null function frames carry no payload
            return;
        }
        self.handle_l2_snap(&data[hlen..]);
    }
}

#[cfg(test)]
mod tests {
    use super::parse_radiotap;

    #[test]
    fn radiotap_lengths() {
        // version 0, len 8, no fields
        assert_eq!(parse_radiotap(&[0, 0, 8, 0, 0, 0, 0, 0, 0xaa]), Some((8, false)));
        // flags field with FCS bit
        assert_eq!(
            parse_radiotap(&[0, 0, 9, 0, 0x02, 0, 0, 0, 0x10]),
            Some((9, true))
        );
        // declared length beyond capture
        assert_eq!(parse_radiotap(&[0, 0, 32, 0, 0, 0, 0, 0]), None);
        // bad version
        assert_eq!(parse_radiotap(&[1, 0, 8, 0, 0, 0, 0, 0]), None);
    }
}
