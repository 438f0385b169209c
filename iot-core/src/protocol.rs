//! Testbed wire protocol: message kinds and their token layout.

/// Handshake sent by a meter to a sensor.
pub const ADD_METER: &str = "addmeter";
/// Handshake sent by a sensor to a meter.
pub const ADD_SENSOR: &str = "addsensor";
/// Acknowledges a handshake on the dial-back connection.
pub const ACK: &str = "OK";
pub const REPORT: &str = "report";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Key prefix of the water value in a report.
pub const WATER_KEY: &str = "w";
/// Key prefix of the power value in a report.
pub const POWER_KEY: &str = "e";

/// All message types. Encoding is the token codec; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `["addmeter"]`: a meter asks the sensor to report to it.
    AddMeter,
    /// `["addsensor"]`: a sensor asks the meter to accept its reports.
    AddSensor,
    /// `[name, "OK"]`: handshake accepted; sent on the dial-back connection.
    Ack { from: String },
    /// `[name, "report", "w:<v>", "e:<v>"]`. Values are kept as sent.
    Report {
        from: String,
        water: String,
        power: String,
    },
    /// `[name, "ping"]`
    Ping { from: String },
    /// `[name, "pong"]`
    Pong { from: String },
    /// Anything this node does not understand.
    Unknown(Vec<String>),
}

impl Message {
    /// Classify a decoded frame. Handshakes are keyed on token 0, everything else on token 1.
    pub fn from_tokens(tokens: &[String]) -> Message {
        match tokens {
            [kind] if kind == ADD_METER => return Message::AddMeter,
            [kind] if kind == ADD_SENSOR => return Message::AddSensor,
            _ => {}
        }
        let (Some(from), Some(kind)) = (tokens.first(), tokens.get(1)) else {
            return Message::Unknown(tokens.to_vec());
        };
        let from = from.clone();
        match kind.as_str() {
            ACK => Message::Ack { from },
            PING => Message::Ping { from },
            PONG => Message::Pong { from },
            REPORT => match parse_report_values(&tokens[2..]) {
                Some((water, power)) => Message::Report { from, water, power },
                None => Message::Unknown(tokens.to_vec()),
            },
            _ => Message::Unknown(tokens.to_vec()),
        }
    }

    /// Token layout of this message, ready for `wire::encode_frame`.
    pub fn to_tokens(&self) -> Vec<String> {
        match self {
            Message::AddMeter => vec![ADD_METER.to_owned()],
            Message::AddSensor => vec![ADD_SENSOR.to_owned()],
            Message::Ack { from } => vec![from.clone(), ACK.to_owned()],
            Message::Report { from, water, power } => vec![
                from.clone(),
                REPORT.to_owned(),
                keyed(WATER_KEY, water),
                keyed(POWER_KEY, power),
            ],
            Message::Ping { from } => vec![from.clone(), PING.to_owned()],
            Message::Pong { from } => vec![from.clone(), PONG.to_owned()],
            Message::Unknown(tokens) => tokens.clone(),
        }
    }

    /// Sender name, for messages that carry one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Message::Ack { from }
            | Message::Report { from, .. }
            | Message::Ping { from }
            | Message::Pong { from } => Some(from),
            _ => None,
        }
    }
}

/// Build a report frame's token list from numeric readings.
pub fn report_tokens(from: &str, water: f64, power: f64) -> Vec<String> {
    Message::Report {
        from: from.to_owned(),
        water: water.to_string(),
        power: power.to_string(),
    }
    .to_tokens()
}

fn keyed(key: &str, value: &str) -> String {
    format!("{key}:{value}")
}

/// Pull `w:` and `e:` values out of report tokens, in any order.
fn parse_report_values(values: &[String]) -> Option<(String, String)> {
    let mut water = None;
    let mut power = None;
    for token in values {
        match token.split_once(':') {
            Some((WATER_KEY, v)) => water = Some(v.to_owned()),
            Some((POWER_KEY, v)) => power = Some(v.to_owned()),
            _ => {}
        }
    }
    Some((water?, power?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn handshakes_are_single_token() {
        assert_eq!(Message::from_tokens(&toks(&["addmeter"])), Message::AddMeter);
        assert_eq!(Message::from_tokens(&toks(&["addsensor"])), Message::AddSensor);
        assert!(matches!(
            Message::from_tokens(&toks(&["addmeter", "extra"])),
            Message::Unknown(_)
        ));
    }

    #[test]
    fn report_values_any_order() {
        let msg = Message::from_tokens(&toks(&["A1", "report", "e:7", "w:3"]));
        assert_eq!(
            msg,
            Message::Report {
                from: "A1".into(),
                water: "3".into(),
                power: "7".into(),
            }
        );
    }

    #[test]
    fn report_missing_value_is_unknown() {
        let msg = Message::from_tokens(&toks(&["A1", "report", "w:3"]));
        assert!(matches!(msg, Message::Unknown(_)));
    }

    #[test]
    fn report_tokens_layout() {
        assert_eq!(report_tokens("A", 3.0, 7.0), toks(&["A", "report", "w:3", "e:7"]));
        assert_eq!(
            report_tokens("A", 2.5, 0.125),
            toks(&["A", "report", "w:2.5", "e:0.125"])
        );
    }

    #[test]
    fn ping_pong_ack() {
        assert_eq!(
            Message::from_tokens(&toks(&["M1", "ping"])),
            Message::Ping { from: "M1".into() }
        );
        let pong = Message::Pong { from: "A1".into() };
        assert_eq!(pong.to_tokens(), toks(&["A1", "pong"]));
        assert_eq!(pong.sender(), Some("A1"));
        assert_eq!(
            Message::from_tokens(&toks(&["A1", "OK"])),
            Message::Ack { from: "A1".into() }
        );
    }

    #[test]
    fn empty_and_unknown() {
        assert!(matches!(Message::from_tokens(&toks(&[""])), Message::Unknown(_)));
        assert!(matches!(
            Message::from_tokens(&toks(&["A1", "dance"])),
            Message::Unknown(_)
        ));
        assert_eq!(Message::AddMeter.sender(), None);
    }
}
