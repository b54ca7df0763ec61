use obsctl_core::Command;
use serde_json::json;

use crate::console::{parse_line, ConsoleInput};

#[test]
fn scan_takes_duration_then_optional_payload() {
    // Arrange
    let line = r#"scan 10 {"scan_id": 7}"#;

    // Act
    let parsed = parse_line(line).expect("parse");

    // Assert
    assert_eq!(
        parsed,
        ConsoleInput::Submit(Command::Scan {
            scan: json!({"scan_id": 7}),
            duration_secs: 10.0,
        })
    );
}

#[test]
fn payload_defaults_to_empty_object() {
    assert_eq!(
        parse_line("assign").expect("parse"),
        ConsoleInput::Submit(Command::AssignResources { resources: json!({}) })
    );
    assert_eq!(
        parse_line("  Configure   ").expect("parse"),
        ConsoleInput::Submit(Command::Configure { configuration: json!({}) })
    );
}

#[test]
fn plain_words_map_to_commands() {
    assert_eq!(parse_line("endscan").expect("parse"), ConsoleInput::Submit(Command::EndScan));
    assert_eq!(parse_line("reset").expect("parse"), ConsoleInput::Submit(Command::ObsReset));
    assert_eq!(parse_line("status").expect("parse"), ConsoleInput::Status);
    assert_eq!(parse_line("").expect("parse"), ConsoleInput::Empty);
    assert_eq!(parse_line("exit").expect("parse"), ConsoleInput::Quit);
}

#[test]
fn malformed_lines_are_errors() {
    assert!(parse_line("scan").is_err(), "missing duration");
    assert!(parse_line("scan soon").is_err(), "non-numeric duration");
    assert!(parse_line("assign {not json").is_err());
    assert!(parse_line("calibrate").is_err());
}
