/// Bus subject names derived from the inbound (peer) and outbound (own) prefixes.
///
/// Everything the relay listens to lives under `{inbound}.>`; everything it
/// emits lives under `{outbound}.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    pub wildcard: String,
    pub ping: String,
    pub pong: String,
    pub relay: String,
    pub job_reply: String,
    pub connected: String,
    pub out_ping: String,
    pub out_pong: String,
    pub job_request: String,
}

impl Subjects {
    pub fn new(inbound: &str, outbound: &str) -> Self {
        Self {
            wildcard: format!("{inbound}.>"),
            ping: format!("{inbound}.ping"),
            pong: format!("{inbound}.pong"),
            relay: format!("{inbound}.proxy-socket"),
            job_reply: format!("{inbound}.job-reply"),
            connected: format!("{outbound}.connected"),
            out_ping: format!("{outbound}.ping"),
            out_pong: format!("{outbound}.pong"),
            job_request: format!("{outbound}.job-request"),
        }
    }
}

impl Default for Subjects {
    fn default() -> Self {
        Self::new("potatbotat", "potat-api")
    }
}
