//! Parsing of `iw dev $DEVICE survey dump` output from `wifi/poll` messages.

use crate::handlers::stations::common::{chunk_lines_by_prefix, split_line};
use crate::handlers::stations::wifi_stations::WifiPollMessage;
use serde::Serialize;
use std::collections::HashMap;

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WifiSurvey {
    pub frequency: String,
    #[serde(rename = "channel active time", skip_serializing_if = "String::is_empty")]
    pub channel_active_time: String,
    #[serde(rename = "channel busy time", skip_serializing_if = "String::is_empty")]
    pub channel_busy_time: String,
    #[serde(rename = "channel receive time", skip_serializing_if = "String::is_empty")]
    pub channel_receive_time: String,
    #[serde(
        rename = "channel transmit time",
        skip_serializing_if = "String::is_empty"
    )]
    pub channel_transmit_time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub noise: String,
    #[serde(rename = "in use", skip_serializing_if = "is_false")]
    pub in_use: bool,
}

/// Parse a survey dump keyed by frequency. When the same frequency appears
/// more than once, the entry with the larger `channel active time` wins.
pub fn parse_wifi_survey(survey: &str) -> HashMap<String, WifiSurvey> {
    let mut surveys: HashMap<String, WifiSurvey> = HashMap::new();

    for chunk in chunk_lines_by_prefix(survey, "Survey", false) {
        let mut current = WifiSurvey::default();

        for line in &chunk {
            let (key, value) = split_line(line);
            match key.as_str() {
                "frequency" => {
                    let (frequency, in_use) = parse_frequency(&value);
                    current.frequency = frequency;
                    current.in_use = in_use;
                }
                "channel active time" => current.channel_active_time = value,
                "channel busy time" => current.channel_busy_time = value,
                "channel receive time" => current.channel_receive_time = value,
                "channel transmit time" => current.channel_transmit_time = value,
                "noise" => current.noise = value,
                _ => {}
            }
        }

        let existing = surveys.remove(&current.frequency);
        let chosen = choose_wifi_survey(current, existing);
        surveys.insert(chosen.frequency.clone(), chosen);
    }

    surveys
}

/// Merge the surveys of every interface in a poll message, preferring the
/// busier sample per frequency.
pub fn compile_survey_message(msg: &WifiPollMessage) -> HashMap<String, WifiSurvey> {
    let mut res: HashMap<String, WifiSurvey> = HashMap::new();

    for iface in msg.interfaces.values() {
        for (freq, survey) in parse_wifi_survey(&iface.survey) {
            let existing = res.remove(&freq);
            res.insert(freq, choose_wifi_survey(survey, existing));
        }
    }

    res
}

fn parse_frequency(val: &str) -> (String, bool) {
    if val.ends_with("[in use]") {
        let freq = val.get(..8).unwrap_or(val).to_string();
        (freq, true)
    } else {
        (val.to_string(), false)
    }
}

fn choose_wifi_survey(a: WifiSurvey, b: Option<WifiSurvey>) -> WifiSurvey {
    match b {
        None => a,
        Some(b) => {
            if parse_active_time(&a) > parse_active_time(&b) {
                a
            } else {
                b
            }
        }
    }
}

fn parse_active_time(s: &WifiSurvey) -> i64 {
    s.channel_active_time
        .replace(" ms", "")
        .trim()
        .parse()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SURVEY_DUMP: &str = "
Survey data from wlan0
	frequency:			2412 MHz [in use]
	noise:				-95 dBm
	channel active time:		1000 ms
	channel busy time:		100 ms
	channel receive time:		50 ms
	channel transmit time:		30 ms
Survey data from wlan0
	frequency:			2417 MHz
	noise:				-95 dBm
Survey data from wlan0
	frequency:			2412 MHz [in use]
	noise:				-94 dBm
	channel active time:		4000 ms
	channel busy time:		900 ms
	channel receive time:		500 ms
	channel transmit time:		300 ms
";

    #[test]
    fn surveys_are_keyed_by_frequency() {
        let surveys = parse_wifi_survey(SURVEY_DUMP);
        assert_eq!(surveys.len(), 2);
        assert!(surveys.contains_key("2412 MHz"));
        assert!(surveys.contains_key("2417 MHz"));
    }

    #[test]
    fn in_use_marker_is_stripped_from_the_frequency() {
        let surveys = parse_wifi_survey(SURVEY_DUMP);
        let busy = &surveys["2412 MHz"];
        assert!(busy.in_use);
        assert!(!surveys["2417 MHz"].in_use);
    }

    #[test]
    fn larger_channel_active_time_wins() {
        let surveys = parse_wifi_survey(SURVEY_DUMP);
        assert_eq!(surveys["2412 MHz"].channel_active_time, "4000 ms");
        assert_eq!(surveys["2412 MHz"].noise, "-94 dBm");
    }

    #[test]
    fn empty_fields_are_omitted_from_json() {
        let surveys = parse_wifi_survey(SURVEY_DUMP);
        let json = serde_json::to_value(&surveys["2417 MHz"]).unwrap();
        assert_eq!(json["frequency"], "2417 MHz");
        assert_eq!(json["noise"], "-95 dBm");
        assert!(json.get("channel active time").is_none());
        assert!(json.get("in use").is_none());
    }
}
