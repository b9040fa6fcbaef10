//! Reserved stats query
//!
//! A TXT query for `_dns-proxy-stats.local` is answered locally with one
//! record per upstream summarizing its health and metrics. The response is
//! observational and carries TTL 0 so it is never cached.

use std::str::FromStr;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record, RecordType};

use crate::health::UpstreamReport;

/// Reserved query name served locally
pub const STATS_QUERY_NAME: &str = "_dns-proxy-stats.local.";

/// Check whether a request is the reserved stats query
pub fn is_stats_query(request: &Message) -> bool {
    request.queries().first().is_some_and(|query| {
        query.query_type() == RecordType::TXT
            && query
                .name()
                .to_string()
                .eq_ignore_ascii_case(STATS_QUERY_NAME)
    })
}

/// Build the TXT response for the stats query
pub fn stats_response(request: &Message, reports: &[UpstreamReport]) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(ResponseCode::NoError);

    for query in request.queries() {
        response.add_query(query.clone());
    }

    let name = match Name::from_str(STATS_QUERY_NAME) {
        Ok(name) => name,
        Err(_) => return response,
    };

    for report in reports {
        let latency = report
            .mean_latency_ms
            .map(|ms| format!("{:.1}ms", ms))
            .unwrap_or_else(|| "n/a".to_string());
        let text = format!(
            "{}: state={} success_rate={:.1}% avg_latency={} samples={}",
            report.name,
            report.state,
            report.success_rate * 100.0,
            latency,
            report.sample_count,
        );
        response.add_answer(Record::from_rdata(
            name.clone(),
            0,
            RData::TXT(TXT::new(vec![text])),
        ));
    }
    response
}
