#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};

use bpmail_core::IPN_RECORD_TYPE;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::NULL;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

/// Creates an empty directory under the system temp dir.
pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "{prefix}-{}-{}",
        std::process::id(),
        rand::random::<u64>()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Writes a gateway config pointing at `spool` and returns its path.
pub fn write_config(dir: &Path, spool: &Path, extra: &str) -> PathBuf {
    let path = dir.join("bpmail.toml");
    let body = format!(
        "spool_dir = {:?}\nlocal_eid = \"ipn:42.7\"\n{extra}\n",
        spool.display().to_string()
    );
    std::fs::write(&path, body).expect("write config");
    path
}

/// Serves node records over UDP from a background thread.
///
/// Domains without an entry are answered with NXDOMAIN.
pub fn spawn_node_record_server(records: &[(&str, Vec<Vec<u8>>)]) -> SocketAddr {
    let zone: HashMap<String, Vec<Vec<u8>>> = records
        .iter()
        .map(|(domain, payloads)| (domain.to_ascii_lowercase(), payloads.clone()))
        .collect();
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind dns socket");
    let addr = socket.local_addr().expect("dns addr");

    std::thread::spawn(move || {
        let mut buf = [0_u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf) else {
                return;
            };
            let Ok(request) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            let response = answer(&zone, &request);
            if let Ok(bytes) = response.to_vec() {
                let _ = socket.send_to(&bytes, peer);
            }
        }
    });
    addr
}

fn answer(zone: &HashMap<String, Vec<Vec<u8>>>, request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);
    response.add_queries(request.queries().to_vec());

    let Some(query) = request.queries().first() else {
        response.set_response_code(ResponseCode::FormErr);
        return response;
    };
    let domain = query.name().to_ascii();
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    match zone.get(&domain) {
        Some(payloads) if query.query_type() == RecordType::Unknown(IPN_RECORD_TYPE) => {
            for payload in payloads {
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    0,
                    RData::Unknown {
                        code: RecordType::Unknown(IPN_RECORD_TYPE),
                        rdata: NULL::with(payload.clone()),
                    },
                ));
            }
        }
        Some(_) => {}
        None => {
            response.set_response_code(ResponseCode::NXDomain);
        }
    }
    response
}
