use std::str::from_utf8;

/// Result of the quick header parse, zero-copy where possible.
///
/// `qname` is already canonical: lowercased, dot-terminated.
pub struct QuickQuery<'a> {
    pub tx_id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
    pub recursion_desired: bool,
}

/// Parse the DNS header and the question section of a single-question packet.
///
/// This avoids the full `Message::from_bytes` decode and its allocations on
/// the hot receive path. Packets with anything other than exactly one
/// question fall back to the full parser (returns `None`).
///
/// `buf` holds the normalized domain name; 256 bytes is always enough for a
/// legal name.
pub fn parse_quick<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<QuickQuery<'a>> {
    if packet.len() < 12 {
        return None;
    }

    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    let recursion_desired = packet[2] & 0x01 != 0;

    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count != 1 {
        return None;
    }

    // QNAME starts at offset 12.
    let mut pos = 12;
    let mut buf_pos = 0;

    let mut jumped = false;
    let mut max_jumps = 5;
    let mut current_pos = pos;
    let packet_len = packet.len();

    loop {
        if current_pos >= packet_len {
            return None;
        }
        let len = packet[current_pos];

        if len == 0 {
            if !jumped {
                pos = current_pos + 1;
            }
            break;
        }

        if (len & 0xC0) == 0xC0 {
            // Compression pointer
            if packet_len < current_pos + 2 {
                return None;
            }
            if !jumped {
                pos = current_pos + 2;
                jumped = true;
            }
            let offset = (((len as u16) & 0x3F) << 8) | (packet[current_pos + 1] as u16);
            current_pos = offset as usize;
            max_jumps -= 1;
            if max_jumps == 0 {
                return None; // loop detection
            }
            continue;
        }

        let label_len = len as usize;
        current_pos += 1;
        if packet_len < current_pos + label_len {
            return None;
        }

        // DNS labels are ASCII or Punycode; lowercasing bytes leaves any raw
        // non-ASCII byte untouched, so this stays UTF-8 safe.
        for &b in &packet[current_pos..current_pos + label_len] {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b.to_ascii_lowercase();
            buf_pos += 1;
        }
        if buf_pos >= buf.len() {
            return None;
        }
        buf[buf_pos] = b'.';
        buf_pos += 1;

        current_pos += label_len;
    }

    // Root query: empty name is spelled ".".
    if buf_pos == 0 {
        if buf.is_empty() {
            return None;
        }
        buf[0] = b'.';
        buf_pos = 1;
    }

    if packet.len() < pos + 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
    let qclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);

    let qname = from_utf8(&buf[..buf_pos]).ok()?;

    Some(QuickQuery {
        tx_id,
        qname,
        qtype,
        qclass,
        recursion_desired,
    })
}

/// Canonical domain form used for routing and table keys: trimmed,
/// lowercased, dot-terminated.
pub fn canonical_name(name: &str) -> String {
    let mut canonical = name.trim().to_ascii_lowercase();
    if !canonical.ends_with('.') {
        canonical.push('.');
    }
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{DNSClass, Name, RecordType};
    use std::str::FromStr;

    fn query_packet(name: &str, qtype: RecordType, id: u16) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        let mut query = Query::query(Name::from_str(name).expect("name"), qtype);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        msg.to_vec().expect("encode")
    }

    #[test]
    fn parses_single_question_packet() {
        let packet = query_packet("WWW.Example.COM.", RecordType::AAAA, 0x1234);
        let mut buf = [0u8; 256];
        let q = parse_quick(&packet, &mut buf).expect("quick parse");
        assert_eq!(q.tx_id, 0x1234);
        assert_eq!(q.qname, "www.example.com.");
        assert_eq!(q.qtype, u16::from(RecordType::AAAA));
        assert_eq!(q.qclass, u16::from(DNSClass::IN));
        assert!(q.recursion_desired);
    }

    #[test]
    fn rejects_packet_without_exactly_one_question() {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Query);
        msg.add_query(Query::query(
            Name::from_str("a.example.").expect("name"),
            RecordType::A,
        ));
        msg.add_query(Query::query(
            Name::from_str("b.example.").expect("name"),
            RecordType::A,
        ));
        let packet = msg.to_vec().expect("encode");

        let mut buf = [0u8; 256];
        assert!(parse_quick(&packet, &mut buf).is_none());
    }

    #[test]
    fn rejects_truncated_packet() {
        let packet = query_packet("example.com.", RecordType::A, 7);
        let mut buf = [0u8; 256];
        assert!(parse_quick(&packet[..10], &mut buf).is_none());
    }

    #[test]
    fn parses_root_query() {
        let packet = query_packet(".", RecordType::NS, 1);
        let mut buf = [0u8; 256];
        let q = parse_quick(&packet, &mut buf).expect("quick parse");
        assert_eq!(q.qname, ".");
    }

    #[test]
    fn canonical_name_lowercases_and_appends_root() {
        assert_eq!(canonical_name("Ads.Example"), "ads.example.");
        assert_eq!(canonical_name("ads.example."), "ads.example.");
        assert_eq!(canonical_name("  trailing.space.  "), "trailing.space.");
    }
}
