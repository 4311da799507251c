//! Captive-portal DNS responder: every A query resolves to the device itself.

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, UdpSocket},
};

use log::{debug, info, warn};

const HEADER_LEN: usize = 12;
const MAX_PACKET: usize = 512;
const ANSWER_TTL_SECS: u32 = 60;

const QTYPE_A: u16 = 1;
const QTYPE_ANY: u16 = 255;
const QCLASS_IN: u16 = 1;

/// Builds the reply for `query` into `out`, returning its length.
///
/// Anything that is not a well-formed standard query yields `None` and is
/// dropped without a reply.
pub fn build_captive_response(query: &[u8], ip: Ipv4Addr, out: &mut [u8]) -> Option<usize> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = query[2];
    let is_response = flags & 0x80 != 0;
    let opcode = (flags >> 3) & 0x0F;
    if is_response || opcode != 0 {
        return None;
    }

    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if qdcount == 0 {
        return None;
    }

    let name_end = skip_name(query, HEADER_LEN)?;
    let question_end = name_end + 4;
    if question_end > query.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([query[name_end], query[name_end + 1]]);
    let qclass = u16::from_be_bytes([query[name_end + 2], query[name_end + 3]]) & 0x7FFF;
    let answer = qclass == QCLASS_IN && (qtype == QTYPE_A || qtype == QTYPE_ANY);

    let answer_len = if answer { 16 } else { 0 };
    let total = question_end + answer_len;
    if total > out.len() {
        return None;
    }

    // Header: echo the ID, QR=1 AA=1 with RD copied, no error.
    out[0] = query[0];
    out[1] = query[1];
    out[2] = 0x84 | (flags & 0x01);
    out[3] = 0x00;
    out[4] = 0;
    out[5] = 1;
    out[6] = 0;
    out[7] = u8::from(answer);
    out[8..HEADER_LEN].fill(0);

    // Only the first question is echoed.
    out[HEADER_LEN..question_end].copy_from_slice(&query[HEADER_LEN..question_end]);

    if answer {
        let a = &mut out[question_end..total];
        a[0] = 0xC0;
        a[1] = 0x0C;
        a[2..4].copy_from_slice(&QTYPE_A.to_be_bytes());
        a[4..6].copy_from_slice(&QCLASS_IN.to_be_bytes());
        a[6..10].copy_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
        a[10..12].copy_from_slice(&4_u16.to_be_bytes());
        a[12..16].copy_from_slice(&ip.octets());
    }

    Some(total)
}

fn skip_name(packet: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *packet.get(offset)? as usize;
        if len == 0 {
            return Some(offset + 1);
        }
        // Compression pointers never appear in a query's first question.
        if len & 0xC0 != 0 {
            return None;
        }
        offset += 1 + len;
    }
}

pub struct CaptiveDns {
    socket: UdpSocket,
    ip: Ipv4Addr,
}

impl CaptiveDns {
    pub fn bind(port: u16, ip: Ipv4Addr) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        socket.set_nonblocking(true)?;
        info!("captive DNS listening on port {port}, answering {ip}");
        Ok(Self { socket, ip })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Answers at most one pending query. Returns true if one was read.
    pub fn process_next_request(&self) -> bool {
        let mut query = [0_u8; MAX_PACKET];
        let (len, peer) = match self.socket.recv_from(&mut query) {
            Ok(received) => received,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return false,
            Err(err) => {
                warn!("captive DNS receive failed: {err}");
                return false;
            }
        };

        let mut reply = [0_u8; MAX_PACKET];
        match build_captive_response(&query[..len], self.ip, &mut reply) {
            Some(reply_len) => {
                if let Err(err) = self.socket.send_to(&reply[..reply_len], peer) {
                    warn!("captive DNS reply to {peer} failed: {err}");
                }
            }
            None => debug!("captive DNS dropped malformed packet from {peer}"),
        }
        true
    }
}
