//! IrDA framing: the Linux IrDA pseudo-header and IrLAP

use crate::dissect::Dissector;

/// Linux IrDA pseudo-header, prepended to IrLAP frames in capture files
pub const IRDA_PSEUDO_HLEN: usize = 16;
const IRLAP_HLEN: usize = 2;

const IRLAP_PF_BIT: u8 = 0x10;
const IRLAP_XID_CMD: u8 = 0x2f;
const IRLAP_XID_RSP: u8 = 0xaf;

/// Format identifier, then 32-bit source and destination device addresses
const XID_MIN_LEN: usize = 9;

impl Dissector<'_> {
    pub(crate) fn handle_l2_irda(&mut self, data: &[u8]) {
        trace!("handle_l2_irda (len={})", data.len());
        if data.len() < IRDA_PSEUDO_HLEN {
            self.pkt.l2hlen = data.len();
            self.malformed(format_args!("IrDA pseudo-header with {} bytes", data.len()));
            return;
        }
        self.pkt.l2hlen = IRDA_PSEUDO_HLEN;
        self.handle_l2_irlap(&data[IRDA_PSEUDO_HLEN..]);
    }

    /// IrLAP address and control. XID discovery frames name both ends; other
    /// frames are not dissected further.
    pub(crate) fn handle_l2_irlap(&mut self, data: &[u8]) {
        if data.len() < IRLAP_HLEN {
            self.pkt.l2hlen += data.len();
            self.malformed(format_args!("IrLAP header with {} bytes", data.len()));
            return;
        }
        self.pkt.l2hlen += IRLAP_HLEN;
        let control = data[1] & !IRLAP_PF_BIT;
        if control != IRLAP_XID_CMD && control != IRLAP_XID_RSP {
            self.noproto(format_args!("IrLAP control 0x{:02x}", data[1]));
            return;
        }
        let xid = &data[IRLAP_HLEN..];
        if xid.len() < XID_MIN_LEN {
            self.malformed(format_args!("IrLAP XID with {} bytes", xid.len()));
            return;
        }
        self.pkt.l2s = self.neighbor(&xid[1..5]);
        self.pkt.l2d = self.neighbor(&xid[5..9]);
    }
}
