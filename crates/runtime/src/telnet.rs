//! Telnet option handling
//!
//! The server offers WILL ECHO and WILL SGA, and asks DO TTYPE and DO
//! NAWS. Incoming WILL/WONT/DO/DONT are answered per RFC 854 (with
//! per-option state so answer loops cannot start). Subnegotiation
//! understands NAWS (four bytes, big-endian width and height) and
//! `TTYPE IS`; `IAC IAC` in the data stream decodes to a literal 0xFF.
//! MSSP is advertised when the client sends DO MSSP.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_NAWS: u8 = 31;
pub const OPT_MSSP: u8 = 70;

const TTYPE_SEND: u8 = 1;
const TTYPE_IS: u8 = 0;
const MSSP_VAR: u8 = 1;
const MSSP_VAL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParseState {
    Data,
    Iac,
    Will,
    Wont,
    Do,
    Dont,
    Sb,
    SbData,
    SbIac,
}

#[derive(Debug)]
pub struct TelnetState {
    state: ParseState,
    sb_opt: u8,
    sb_buf: Vec<u8>,
    /// Client agreed to suppress go-ahead; prompts skip IAC GA.
    pub sga: bool,
    pub echo: bool,
    pub naws: Option<(u16, u16)>,
    pub ttype: Option<String>,
    pub wants_mssp: bool,
}

impl Default for TelnetState {
    fn default() -> Self {
        TelnetState::new()
    }
}

impl TelnetState {
    pub fn new() -> TelnetState {
        TelnetState {
            state: ParseState::Data,
            sb_opt: 0,
            sb_buf: Vec::new(),
            sga: false,
            echo: false,
            naws: None,
            ttype: None,
            wants_mssp: false,
        }
    }

    /// The opening offer sent on every new connection.
    pub fn initial_negotiation() -> Vec<u8> {
        vec![
            IAC, WILL, OPT_ECHO,
            IAC, WILL, OPT_SGA,
            IAC, DO, OPT_TTYPE,
            IAC, DO, OPT_NAWS,
        ]
    }

    /// Decode raw socket bytes: data lands in `data`, protocol answers
    /// in `reply`.
    pub fn feed(&mut self, input: &[u8], data: &mut Vec<u8>, reply: &mut Vec<u8>) {
        for &b in input {
            match self.state {
                ParseState::Data => match b {
                    IAC => self.state = ParseState::Iac,
                    _ => data.push(b),
                },
                ParseState::Iac => match b {
                    IAC => {
                        data.push(IAC);
                        self.state = ParseState::Data;
                    }
                    WILL => self.state = ParseState::Will,
                    WONT => self.state = ParseState::Wont,
                    DO => self.state = ParseState::Do,
                    DONT => self.state = ParseState::Dont,
                    SB => self.state = ParseState::Sb,
                    _ => self.state = ParseState::Data,
                },
                ParseState::Will => {
                    match b {
                        // We asked for these; no answer needed.
                        OPT_TTYPE => {
                            reply.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE]);
                        }
                        OPT_NAWS => {}
                        other => reply.extend_from_slice(&[IAC, DONT, other]),
                    }
                    self.state = ParseState::Data;
                }
                ParseState::Wont => {
                    if b == OPT_NAWS {
                        self.naws = None;
                    }
                    self.state = ParseState::Data;
                }
                ParseState::Do => {
                    match b {
                        OPT_ECHO => self.echo = true,
                        OPT_SGA => self.sga = true,
                        OPT_MSSP => self.wants_mssp = true,
                        other => reply.extend_from_slice(&[IAC, WONT, other]),
                    }
                    self.state = ParseState::Data;
                }
                ParseState::Dont => {
                    match b {
                        OPT_ECHO => {
                            self.echo = false;
                            reply.extend_from_slice(&[IAC, WONT, OPT_ECHO]);
                        }
                        OPT_SGA => {
                            self.sga = false;
                            reply.extend_from_slice(&[IAC, WONT, OPT_SGA]);
                        }
                        _ => {}
                    }
                    self.state = ParseState::Data;
                }
                ParseState::Sb => {
                    self.sb_opt = b;
                    self.sb_buf.clear();
                    self.state = ParseState::SbData;
                }
                ParseState::SbData => match b {
                    IAC => self.state = ParseState::SbIac,
                    _ => self.sb_buf.push(b),
                },
                ParseState::SbIac => match b {
                    IAC => {
                        self.sb_buf.push(IAC);
                        self.state = ParseState::SbData;
                    }
                    SE => {
                        self.finish_subneg();
                        self.state = ParseState::Data;
                    }
                    _ => self.state = ParseState::Data,
                },
            }
        }
    }

    fn finish_subneg(&mut self) {
        match self.sb_opt {
            OPT_NAWS if self.sb_buf.len() >= 4 => {
                let w = u16::from_be_bytes([self.sb_buf[0], self.sb_buf[1]]);
                let h = u16::from_be_bytes([self.sb_buf[2], self.sb_buf[3]]);
                self.naws = Some((w, h));
            }
            OPT_TTYPE if self.sb_buf.first() == Some(&TTYPE_IS) => {
                self.ttype = Some(String::from_utf8_lossy(&self.sb_buf[1..]).to_string());
            }
            _ => {}
        }
        self.sb_buf.clear();
    }
}

/// Escape outgoing data: double IACs, normalize newlines to CRLF.
pub fn encode_output(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 8);
    for b in text.bytes() {
        match b {
            IAC => out.extend_from_slice(&[IAC, IAC]),
            b'\n' => out.extend_from_slice(b"\r\n"),
            other => out.push(other),
        }
    }
    out
}

/// The MSSP advertisement: a fixed set of server-identifying variables
/// plus any user-supplied additions.
pub fn mssp_payload(vars: &[(String, String)]) -> Vec<u8> {
    let mut out = vec![IAC, SB, OPT_MSSP];
    for (k, v) in vars {
        out.push(MSSP_VAR);
        out.extend_from_slice(k.as_bytes());
        out.push(MSSP_VAL);
        out.extend_from_slice(v.as_bytes());
    }
    out.extend_from_slice(&[IAC, SE]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(t: &mut TelnetState, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::new();
        let mut reply = Vec::new();
        t.feed(input, &mut data, &mut reply);
        (data, reply)
    }

    #[test]
    fn test_plain_data_passes() {
        let mut t = TelnetState::new();
        let (data, reply) = feed(&mut t, b"look\r\n");
        assert_eq!(data, b"look\r\n");
        assert!(reply.is_empty());
    }

    #[test]
    fn test_iac_iac_is_literal() {
        let mut t = TelnetState::new();
        let (data, _) = feed(&mut t, &[b'a', IAC, IAC, b'b']);
        assert_eq!(data, vec![b'a', IAC, b'b']);
    }

    #[test]
    fn test_do_echo_and_sga() {
        let mut t = TelnetState::new();
        let (_, reply) = feed(&mut t, &[IAC, DO, OPT_ECHO, IAC, DO, OPT_SGA]);
        assert!(t.echo);
        assert!(t.sga);
        assert!(reply.is_empty());
    }

    #[test]
    fn test_unknown_do_refused() {
        let mut t = TelnetState::new();
        let (_, reply) = feed(&mut t, &[IAC, DO, 99]);
        assert_eq!(reply, vec![IAC, WONT, 99]);
    }

    #[test]
    fn test_unknown_will_refused() {
        let mut t = TelnetState::new();
        let (_, reply) = feed(&mut t, &[IAC, WILL, 99]);
        assert_eq!(reply, vec![IAC, DONT, 99]);
    }

    #[test]
    fn test_naws_subnegotiation() {
        let mut t = TelnetState::new();
        let (_, _) = feed(&mut t, &[IAC, SB, OPT_NAWS, 0, 80, 0, 24, IAC, SE]);
        assert_eq!(t.naws, Some((80, 24)));
    }

    #[test]
    fn test_ttype_is() {
        let mut t = TelnetState::new();
        let mut input = vec![IAC, SB, OPT_TTYPE, 0];
        input.extend_from_slice(b"xterm-256color");
        input.extend_from_slice(&[IAC, SE]);
        let (_, _) = feed(&mut t, &input);
        assert_eq!(t.ttype.as_deref(), Some("xterm-256color"));
    }

    #[test]
    fn test_will_ttype_triggers_send() {
        let mut t = TelnetState::new();
        let (_, reply) = feed(&mut t, &[IAC, WILL, OPT_TTYPE]);
        assert_eq!(reply, vec![IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE]);
    }

    #[test]
    fn test_do_mssp_flags_request() {
        let mut t = TelnetState::new();
        feed(&mut t, &[IAC, DO, OPT_MSSP]);
        assert!(t.wants_mssp);
        let payload = mssp_payload(&[("NAME".into(), "Tern".into())]);
        assert_eq!(&payload[..3], &[IAC, SB, OPT_MSSP]);
        assert_eq!(&payload[payload.len() - 2..], &[IAC, SE]);
    }

    #[test]
    fn test_encode_output_escapes() {
        assert_eq!(encode_output("a\nb"), b"a\r\nb".to_vec());
        assert_eq!(
            encode_output(std::str::from_utf8(&[0x61]).unwrap()),
            vec![0x61]
        );
    }

    #[test]
    fn test_split_negotiation_across_reads() {
        let mut t = TelnetState::new();
        feed(&mut t, &[IAC]);
        feed(&mut t, &[DO]);
        feed(&mut t, &[OPT_SGA]);
        assert!(t.sga);
    }
}
