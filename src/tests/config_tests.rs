use crate::cli::Cli;
use crate::config::*;
use crate::gateway::IpProtocol;
use crate::Error;
use clap::Parser;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use tempfile::{NamedTempFile, TempDir};

const FULL_SETTINGS: &str = r#"{
    "executable": {
        "file": "server",
        "workingDirectory": "/srv/game",
        "parameters": "-port 7777 -log"
    },
    "mappings": [
        { "protocol": "TCP", "localPort": 7777, "publicPort": 7777 },
        { "protocol": "udp", "localAddress": "192.168.1.20", "localPort": 7778, "publicPort": 17778 }
    ],
    "noLaunchMode": false,
    "shutdownGraceSeconds": 10
}"#;

fn write_settings(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write settings");
    file
}

// ========================================================================
// Parsing
// ========================================================================

#[test]
fn test_parse_full_settings() {
    let settings: Settings = serde_json::from_str(FULL_SETTINGS).unwrap();

    assert_eq!(settings.executable.file.as_deref(), Some("server"));
    assert_eq!(
        settings.executable.working_directory,
        Some(PathBuf::from("/srv/game"))
    );
    assert_eq!(settings.mappings.len(), 2);
    assert_eq!(settings.mappings[0].protocol, IpProtocol::TCP);
    assert_eq!(settings.mappings[0].local_address, None);
    assert_eq!(settings.mappings[1].protocol, IpProtocol::UDP);
    assert_eq!(
        settings.mappings[1].local_address,
        Some("192.168.1.20".parse::<IpAddr>().unwrap())
    );
    assert_eq!(settings.mappings[1].public_port, 17778);
    assert_eq!(settings.shutdown_grace_seconds, 10);
    assert_eq!(settings.discovery_timeout_seconds, 5, "Unset fields keep defaults");
}

#[test]
fn test_parse_legacy_keys() {
    let json = r#"{
        "executable": { "file": "srv", "workingdirectory": "/tmp" },
        "upnp": [
            { "protocol": "tcp", "localIPAddress": "", "localPort": 80, "publicPort": 8080 },
            { "protocol": "Udp", "localIPAddress": "10.0.0.2", "localPort": 53, "publicPort": 5353 }
        ],
        "testmode": true
    }"#;

    let settings: Settings = serde_json::from_str(json).unwrap();

    assert!(settings.no_launch_mode);
    assert_eq!(settings.executable.working_directory, Some(PathBuf::from("/tmp")));
    assert_eq!(settings.mappings.len(), 2);
    assert_eq!(settings.mappings[0].local_address, None, "Empty address means unset");
    assert_eq!(
        settings.mappings[1].local_address,
        Some("10.0.0.2".parse::<IpAddr>().unwrap())
    );
}

#[test]
fn test_parse_rejects_bad_address() {
    let json = r#"{ "mappings": [
        { "protocol": "tcp", "localAddress": "not-an-ip", "localPort": 80, "publicPort": 80 }
    ] }"#;
    assert!(serde_json::from_str::<Settings>(json).is_err());
}

#[test]
fn test_parse_rejects_unknown_protocol() {
    let json = r#"{ "mappings": [ { "protocol": "sctp", "localPort": 80, "publicPort": 80 } ] }"#;
    assert!(serde_json::from_str::<Settings>(json).is_err());
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();

    assert!(settings.executable.file.is_none());
    assert!(settings.mappings.is_empty());
    assert!(!settings.no_launch_mode);
    assert_eq!(settings.discovery_timeout().as_secs(), 5);
    assert_eq!(settings.shutdown_grace().as_secs(), 5);
    assert_eq!(settings.no_launch_hold().as_secs(), 5);
    assert_eq!(settings.lease_seconds, 0);
}

#[test]
fn test_parameters_line_and_list() {
    let line = Parameters::Line("  -port 7777   -log ".to_string());
    assert_eq!(line.to_args(), vec!["-port", "7777", "-log"]);

    let list = Parameters::List(vec!["a b".to_string(), "c".to_string()]);
    assert_eq!(list.to_args(), vec!["a b", "c"], "List entries are not split");

    let parsed: Parameters = serde_json::from_str(r#"["--name", "my server"]"#).unwrap();
    assert_eq!(parsed, Parameters::List(vec!["--name".into(), "my server".into()]));
}

// ========================================================================
// Validation
// ========================================================================

#[test]
fn test_validate_reports_every_problem() {
    let problems = Settings::default().validate().unwrap_err();

    assert_eq!(problems.len(), 3);
    assert!(problems.iter().any(|p| p.contains("executable.file")));
    assert!(problems.iter().any(|p| p.contains("executable.workingDirectory")));
    assert!(problems.iter().any(|p| p.contains("Missing mapping configuration")));
}

#[test]
fn test_validate_no_launch_skips_executable() {
    let mut settings = Settings {
        no_launch_mode: true,
        ..Settings::default()
    };
    let problems = settings.validate().unwrap_err();
    assert_eq!(problems.len(), 1, "Only the missing mappings are reported");

    settings.mappings.push("tcp:80:80".parse().unwrap());
    assert!(settings.validate().is_ok());
}

#[test]
fn test_validate_zero_ports() {
    let settings = Settings {
        no_launch_mode: true,
        mappings: vec!["tcp:0:80".parse().unwrap(), "udp:53:0".parse().unwrap()],
        ..Settings::default()
    };

    let problems = settings.validate().unwrap_err();
    assert_eq!(problems.len(), 2);
    assert!(problems[0].contains("#0") && problems[0].contains("local port"));
    assert!(problems[1].contains("#1") && problems[1].contains("public port"));
}

#[test]
fn test_validate_blank_file_name() {
    let mut settings: Settings = serde_json::from_str(FULL_SETTINGS).unwrap();
    assert!(settings.validate().is_ok());

    settings.executable.file = Some("   ".to_string());
    let problems = settings.validate().unwrap_err();
    assert!(problems[0].contains("executable.file"));
}

#[test]
fn test_launch_spec() {
    let settings: Settings = serde_json::from_str(FULL_SETTINGS).unwrap();
    let launch = settings.launch_spec().expect("Complete settings launch");

    assert_eq!(launch.program, "server");
    assert_eq!(launch.working_directory, PathBuf::from("/srv/game"));
    assert_eq!(launch.args, vec!["-port", "7777", "-log"]);

    let no_launch = Settings {
        no_launch_mode: true,
        ..settings
    };
    assert!(no_launch.launch_spec().is_none());
}

// ========================================================================
// Mapping strings
// ========================================================================

#[test]
fn test_mapping_from_str() {
    let plain: MappingConfig = "tcp:8080:80".parse().unwrap();
    assert_eq!(plain.protocol, IpProtocol::TCP);
    assert_eq!(plain.local_port, 8080);
    assert_eq!(plain.public_port, 80);
    assert_eq!(plain.local_address, None);

    let addressed: MappingConfig = "UDP:27015:27015@192.168.1.10".parse().unwrap();
    assert_eq!(addressed.protocol, IpProtocol::UDP);
    assert_eq!(
        addressed.local_address,
        Some("192.168.1.10".parse::<IpAddr>().unwrap())
    );
}

#[test]
fn test_mapping_from_str_invalid() {
    for bad in [
        "tcp:8080",
        "tcp:8080:80:1",
        "icmp:1:1",
        "tcp:http:80",
        "tcp:8080:70000",
        "tcp:8080:80@nowhere",
    ] {
        assert!(bad.parse::<MappingConfig>().is_err(), "'{}' should not parse", bad);
    }
}

// ========================================================================
// Loading and layering
// ========================================================================

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::load(dir.path().join("absent.json")).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
fn test_load_empty_file_uses_defaults() {
    let file = write_settings("  \n");
    let settings = Settings::load(file.path()).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
fn test_load_invalid_json() {
    let file = write_settings("{ \"mappings\": [ ");
    match Settings::load(file.path()) {
        Err(Error::ConfigInvalid(message)) => assert!(message.contains("Failed to parse")),
        other => panic!("Expected ConfigInvalid, got {:?}", other),
    }
}

#[test]
fn test_load_file() {
    let file = write_settings(FULL_SETTINGS);
    let settings = Settings::load(file.path()).unwrap();
    assert_eq!(settings.mappings.len(), 2);
    assert_eq!(settings.executable.file.as_deref(), Some("server"));
}

#[test]
fn test_from_cli_explicit_missing_file() {
    let dir = TempDir::new().unwrap();
    let cli = Cli {
        config: Some(dir.path().join("missing.json")),
        ..Cli::default()
    };

    assert!(matches!(Settings::from_cli(&cli), Err(Error::ConfigInvalid(_))));
}

#[test]
fn test_from_cli_overrides_file() {
    let file = write_settings(FULL_SETTINGS);
    let cli = Cli::try_parse_from([
        "portforwarded",
        "--config",
        file.path().to_str().unwrap(),
        "--map",
        "tcp:25565:25565",
        "--parameters",
        "--nogui",
        "--grace",
        "2",
        "-vv",
    ])
    .unwrap();

    let settings = Settings::from_cli(&cli).unwrap();

    assert_eq!(cli.verbose, 2);
    assert_eq!(settings.mappings.len(), 1, "CLI mappings replace file mappings");
    assert_eq!(settings.mappings[0].public_port, 25565);
    assert_eq!(settings.executable.file.as_deref(), Some("server"));
    assert_eq!(
        settings.launch_spec().unwrap().args,
        vec!["--nogui"],
        "Parameters may start with a hyphen"
    );
    assert_eq!(settings.shutdown_grace_seconds, 2);
}

#[test]
fn test_apply_cli_leaves_unset_values() {
    let mut settings: Settings = serde_json::from_str(FULL_SETTINGS).unwrap();
    let before = settings.clone();

    settings.apply_cli(&Cli::default());
    assert_eq!(settings, before);

    let cli = Cli {
        no_launch: true,
        hold: Some(60),
        lease: Some(3600),
        mappings: vec!["udp:9000:9000".parse().unwrap(), "tcp:9000:9000".parse().unwrap()],
        ..Cli::default()
    };
    settings.apply_cli(&cli);

    assert!(settings.no_launch_mode);
    assert_eq!(settings.no_launch_hold_seconds, 60);
    assert_eq!(settings.lease_seconds, 3600);
    assert_eq!(settings.mappings.len(), 2);
}

#[test]
fn test_cli_comma_separated_mappings() {
    let cli = Cli::try_parse_from(["portforwarded", "-m", "tcp:80:80,udp:53:53@10.0.0.1"]).unwrap();
    assert_eq!(cli.mappings.len(), 2);
    assert_eq!(cli.mappings[1].protocol, IpProtocol::UDP);

    assert!(Cli::try_parse_from(["portforwarded", "-m", "tcp:80"]).is_err());
}
