//! In-memory pcap capture stream.
//!
//! Classic little-endian microsecond pcap, readable by the usual
//! analyzers. Frames are appended as they pass the Ethernet receive
//! hook; `finish` hands back the accumulated buffer.

use byteorder::{ByteOrder, LittleEndian};
use std::time::{SystemTime, UNIX_EPOCH};

const MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 0xffff_ffff;
const LINKTYPE_ETHERNET: u32 = 1;

pub struct PcapStream {
    buf: Vec<u8>,
}

impl PcapStream {
    pub fn new() -> PcapStream {
        let mut buf = vec![0u8; 24];
        LittleEndian::write_u32(&mut buf[0..4], MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], VERSION_MAJOR);
        LittleEndian::write_u16(&mut buf[6..8], VERSION_MINOR);
        // thiszone and sigfigs stay zero
        LittleEndian::write_u32(&mut buf[16..20], SNAPLEN);
        LittleEndian::write_u32(&mut buf[20..24], LINKTYPE_ETHERNET);
        PcapStream { buf }
    }

    pub fn record(&mut self, frame: &[u8]) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut header = [0u8; 16];
        LittleEndian::write_u32(&mut header[0..4], now.as_secs() as u32);
        LittleEndian::write_u32(&mut header[4..8], now.subsec_micros());
        LittleEndian::write_u32(&mut header[8..12], frame.len() as u32);
        LittleEndian::write_u32(&mut header[12..16], frame.len() as u32);
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(frame);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for PcapStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_header_layout() {
        let stream = PcapStream::new();
        let buf = stream.finish();
        assert_eq!(buf.len(), 24);
        assert_eq!(LittleEndian::read_u32(&buf[0..4]), 0xa1b2c3d4);
        assert_eq!(LittleEndian::read_u16(&buf[4..6]), 2);
        assert_eq!(LittleEndian::read_u16(&buf[6..8]), 4);
        assert_eq!(LittleEndian::read_u32(&buf[16..20]), 0xffffffff);
        assert_eq!(LittleEndian::read_u32(&buf[20..24]), 1);
    }

    #[test]
    fn test_records_appended() {
        let mut stream = PcapStream::new();
        stream.record(&[0xaa; 60]);
        stream.record(&[0xbb; 42]);
        let buf = stream.finish();
        assert_eq!(buf.len(), 24 + 16 + 60 + 16 + 42);
        assert_eq!(LittleEndian::read_u32(&buf[24 + 8..24 + 12]), 60);
        assert_eq!(LittleEndian::read_u32(&buf[24 + 12..24 + 16]), 60);
        assert_eq!(&buf[40..100], &[0xaa; 60][..]);
        let second = 24 + 16 + 60;
        assert_eq!(LittleEndian::read_u32(&buf[second + 8..second + 12]), 42);
    }
}
