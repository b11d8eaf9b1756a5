use clap::Parser;

use super::{Cli, CliCommand};

#[test]
fn parse_get_with_options() {
    let cli = Cli::try_parse_from([
        "surge",
        "get",
        "https://example.com/file.iso",
        "--dir",
        "/tmp/downloads",
        "--connections",
        "8",
        "--sequential",
    ])
    .unwrap();
    match cli.command {
        CliCommand::Get {
            urls,
            dir,
            connections,
            sequential,
            filename,
        } => {
            assert_eq!(urls, vec!["https://example.com/file.iso"]);
            assert_eq!(dir.unwrap().to_string_lossy(), "/tmp/downloads");
            assert_eq!(connections, Some(8));
            assert!(sequential);
            assert!(filename.is_none());
        }
        other => panic!("wrong command: {:?}", other),
    }
}

#[test]
fn parse_get_requires_url() {
    assert!(Cli::try_parse_from(["surge", "get"]).is_err());
}

#[test]
fn parse_get_multiple_urls() {
    let cli = Cli::try_parse_from(["surge", "get", "https://a/x", "https://b/y"]).unwrap();
    match cli.command {
        CliCommand::Get { urls, .. } => assert_eq!(urls.len(), 2),
        other => panic!("wrong command: {:?}", other),
    }
}

#[test]
fn parse_resume_and_remove() {
    let cli = Cli::try_parse_from(["surge", "resume", "abc123"]).unwrap();
    assert!(matches!(cli.command, CliCommand::Resume { ref id } if id == "abc123"));

    let cli = Cli::try_parse_from(["surge", "remove", "abc123", "--delete-files"]).unwrap();
    match cli.command {
        CliCommand::Remove { id, delete_files } => {
            assert_eq!(id, "abc123");
            assert!(delete_files);
        }
        other => panic!("wrong command: {:?}", other),
    }
}

#[test]
fn parse_status_takes_no_args() {
    assert!(Cli::try_parse_from(["surge", "status"]).is_ok());
    assert!(Cli::try_parse_from(["surge", "status", "extra"]).is_err());
}
