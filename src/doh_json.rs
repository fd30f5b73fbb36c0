use std::str::FromStr;

use anyhow::Context;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, PTR, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use serde::Deserialize;
use tracing::debug;

use crate::metrics::Metrics;

/// One answer of a `application/dns-json` response (Google and Cloudflare
/// speak the same shape).
#[derive(Debug, Deserialize)]
struct JsonAnswer {
    name: String,
    #[serde(rename = "type")]
    rr_type: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    data: String,
}

#[derive(Debug, Deserialize)]
struct JsonResponse {
    #[serde(rename = "Status")]
    status: u16,
    #[serde(rename = "Answer", default)]
    answer: Vec<JsonAnswer>,
}

/// Translate a JSON upstream reply into a regular DNS response mirroring the
/// request's question section.
///
/// Answers with an unsupported record type, or data that does not parse for
/// the claimed type, are skipped. Each decoded status and record type is
/// tallied into the metrics.
pub fn decode_json_response(
    request: &Message,
    body: &[u8],
    metrics: &Metrics,
) -> anyhow::Result<Message> {
    let parsed: JsonResponse =
        serde_json::from_slice(body).context("parse dns-json response body")?;

    let mut resp = Message::new();
    resp.set_id(request.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(OpCode::Query);
    resp.set_recursion_desired(request.recursion_desired());
    resp.set_recursion_available(true);
    resp.add_queries(request.queries().iter().cloned().collect::<Vec<_>>());

    let rcode = ResponseCode::from((parsed.status >> 4) as u8, (parsed.status & 0x0F) as u8);
    resp.set_response_code(rcode);
    metrics.record_rcode(rcode);

    for answer in &parsed.answer {
        let rr_type = RecordType::from(answer.rr_type);
        metrics.record_rrtype(rr_type);

        let name = match fqdn(&answer.name) {
            Ok(name) => name,
            Err(err) => {
                debug!(name = %answer.name, error = %err, "skipping json answer with bad name");
                continue;
            }
        };

        let rdata = match rr_type {
            RecordType::A => match answer.data.parse() {
                Ok(addr) => RData::A(A(addr)),
                Err(_) => {
                    debug!(data = %answer.data, "skipping A answer with bad address");
                    continue;
                }
            },
            RecordType::AAAA => match answer.data.parse() {
                Ok(addr) => RData::AAAA(AAAA(addr)),
                Err(_) => {
                    debug!(data = %answer.data, "skipping AAAA answer with bad address");
                    continue;
                }
            },
            RecordType::CNAME => match fqdn(&answer.data) {
                Ok(target) => RData::CNAME(CNAME(target)),
                Err(_) => {
                    debug!(data = %answer.data, "skipping CNAME answer with bad target");
                    continue;
                }
            },
            RecordType::PTR => match fqdn(&answer.data) {
                Ok(target) => RData::PTR(PTR(target)),
                Err(_) => {
                    debug!(data = %answer.data, "skipping PTR answer with bad target");
                    continue;
                }
            },
            // JSON answers quote TXT payloads
            RecordType::TXT => RData::TXT(TXT::new(vec![answer
                .data
                .trim_matches('"')
                .to_string()])),
            other => {
                debug!(rrtype = %other, "skipping json answer with unhandled type");
                continue;
            }
        };

        resp.add_answer(Record::from_rdata(name, answer.ttl, rdata));
    }

    Ok(resp)
}

fn fqdn(value: &str) -> anyhow::Result<Name> {
    let mut name =
        Name::from_str(value).with_context(|| format!("invalid domain name {value:?}"))?;
    name.set_fqdn(true);
    Ok(name)
}
