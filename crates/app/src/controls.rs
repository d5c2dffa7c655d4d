//! Operator commands read from stdin.

use std::{
    io::{self, BufRead},
    thread::JoinHandle,
};

use crossbeam_channel::Sender;
use tracing::debug;
use vision::{AnalysisMode, telemetry};

pub const HELP: &str = "commands: <enter> analyse now | a <prompt> analyse with a one-off prompt | \
c cancel | m continuous|on-demand switch mode | p <prompt> set prompt | r restart source | \
s status | q quit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Analyse(Option<String>),
    Cancel,
    Mode(AnalysisMode),
    Prompt(String),
    Restart,
    Status,
    Quit,
}

pub fn parse_control(line: &str) -> Result<Control, String> {
    let line = line.trim();
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match (command, rest) {
        ("" | "a", "") => Ok(Control::Analyse(None)),
        ("a", prompt) => Ok(Control::Analyse(Some(prompt.to_string()))),
        ("c", "") => Ok(Control::Cancel),
        ("m", "continuous") => Ok(Control::Mode(AnalysisMode::Continuous)),
        ("m", "on-demand" | "ondemand") => Ok(Control::Mode(AnalysisMode::OnDemand)),
        ("m", other) => Err(format!("unknown mode {other:?}; expected continuous or on-demand")),
        ("p", "") => Err("p needs a prompt".to_string()),
        ("p", prompt) => Ok(Control::Prompt(prompt.to_string())),
        ("r", "") => Ok(Control::Restart),
        ("s", "") => Ok(Control::Status),
        ("q" | "quit" | "exit", "") => Ok(Control::Quit),
        _ => Err(format!("unrecognised command {line:?}")),
    }
}

/// Forward parsed stdin lines until EOF or until the receiver goes away.
pub fn spawn_stdin_reader(tx: Sender<Control>) -> io::Result<JoinHandle<()>> {
    telemetry::spawn_thread("vlm-stdin", move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match parse_control(&line) {
                Ok(control) => {
                    if tx.send(control).is_err() {
                        break;
                    }
                }
                Err(message) => eprintln!("{message}\n{HELP}"),
            }
        }
        debug!("stdin closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_control(""), Ok(Control::Analyse(None)));
        assert_eq!(
            parse_control("a  what is on the table? "),
            Ok(Control::Analyse(Some("what is on the table?".into())))
        );
        assert_eq!(parse_control("c"), Ok(Control::Cancel));
        assert_eq!(
            parse_control("m on-demand"),
            Ok(Control::Mode(AnalysisMode::OnDemand))
        );
        assert_eq!(
            parse_control("m continuous"),
            Ok(Control::Mode(AnalysisMode::Continuous))
        );
        assert_eq!(
            parse_control("p count the mugs"),
            Ok(Control::Prompt("count the mugs".into()))
        );
        assert_eq!(parse_control(" q "), Ok(Control::Quit));
    }

    #[test]
    fn rejects_unknown_input() {
        assert!(parse_control("m sideways").is_err());
        assert!(parse_control("p").is_err());
        assert!(parse_control("c now").is_err());
        assert!(parse_control("launch").is_err());
    }
}
