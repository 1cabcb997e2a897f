//! Mail source clients and polling handlers (§4.3 `MailReader`, §4.7
//! "IMAP"/"POP3").
//!
//! The `imap` crate's client is synchronous, so every call runs inside
//! `tokio::task::spawn_blocking` to keep the async poller loop responsive.
//! POP3 has no comparable maintained async or sync client crate, so
//! [`Pop3Client`] speaks the (small) text protocol directly over a TLS
//! stream — `RETR`/`LIST`/`UIDL` is the entire surface this needs.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use async_trait::async_trait;
use chrono::Utc;
use jervis_core::staging::StagingStore;
use jervis_core::types::{Client, Connection, ConnectionKind, PollingCursor, SourceKind, StagedArtifact};
use serde_json::json;

use crate::error::{Result, SourceError};
use crate::handler::PollingHandler;
use crate::types::{MailAttachment, MailMessage, PollOutcome};

fn parse_message(uid: u64, folder: &str, raw: &[u8]) -> MailMessage {
    let parsed = mailparse::parse_mail(raw).ok();

    let header = |name: &str| -> String {
        parsed
            .as_ref()
            .and_then(|p| p.headers.iter().find(|h| h.get_key_ref().eq_ignore_ascii_case(name)))
            .map(|h| h.get_value())
            .unwrap_or_default()
    };

    let message_id = {
        let raw_id = header("Message-ID");
        if raw_id.is_empty() {
            format!("<generated-{uid}@jervis>")
        } else {
            raw_id
        }
    };

    let to: Vec<String> = header("To").split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();

    let mut text_body = String::new();
    let mut html_body = None;
    let mut attachments = Vec::new();

    if let Some(parsed) = &parsed {
        collect_parts(parsed, &mut text_body, &mut html_body, &mut attachments);
    } else {
        text_body = "[ERROR: failed to parse message body]".to_string();
    }

    MailMessage {
        uid,
        message_id,
        folder: folder.to_string(),
        from: header("From"),
        to,
        subject: header("Subject"),
        text_body,
        html_body,
        attachments,
        received_at: Utc::now(),
    }
}

fn collect_parts(
    part: &mailparse::ParsedMail,
    text_body: &mut String,
    html_body: &mut Option<String>,
    attachments: &mut Vec<MailAttachment>,
) {
    if part.subparts.is_empty() {
        let content_type = part.ctype.mimetype.clone();
        if let Some(filename) = part.get_content_disposition().params.get("filename").cloned() {
            attachments.push(MailAttachment {
                filename,
                content_type,
                size_bytes: part.get_body_raw().map(|b| b.len() as u64).unwrap_or(0),
            });
            return;
        }
        match part.get_body() {
            Ok(body) if content_type == "text/html" => *html_body = Some(body),
            Ok(body) => text_body.push_str(&body),
            Err(_) => text_body.push_str("[ERROR: failed to decode part]"),
        }
    } else {
        for sub in &part.subparts {
            collect_parts(sub, text_body, html_body, attachments);
        }
    }
}

fn message_to_artifact(
    client_id: uuid::Uuid,
    connection_id: uuid::Uuid,
    source_key: String,
    message: &MailMessage,
) -> StagedArtifact {
    StagedArtifact::new(
        SourceKind::Email,
        client_id,
        None,
        connection_id,
        source_key,
        json!({
            "from": message.from,
            "to": message.to,
            "subject": message.subject,
            "text_body": message.text_body,
            "html_body": message.html_body,
            "attachments": message.attachments,
            "folder": message.folder,
        }),
        message.received_at,
    )
}

// ---------------------------------------------------------------------------
// IMAP
// ---------------------------------------------------------------------------

pub struct ImapPollingHandler;

#[async_trait]
impl PollingHandler for ImapPollingHandler {
    fn can_handle(&self, connection: &Connection) -> bool {
        matches!(connection.kind, ConnectionKind::Imap { .. })
    }

    async fn poll(&self, store: &StagingStore, connection: &Connection, clients: &[Client]) -> Result<PollOutcome> {
        let ConnectionKind::Imap {
            host,
            port,
            username,
            password,
            use_ssl,
            folder_name,
        } = connection.kind.clone()
        else {
            return Err(SourceError::Permanent("not an imap connection".to_string()));
        };

        let cursor = store.get_cursor(connection.id).await?;
        let last_uid = cursor.last_fetched_uid.unwrap_or(0);

        let (messages, max_uid) = tokio::task::spawn_blocking(move || {
            fetch_new_imap_messages(&host, port, &username, &password, use_ssl, &folder_name, last_uid)
        })
        .await
        .map_err(|e| SourceError::Transient(e.to_string()))??;

        let mut outcome = PollOutcome {
            discovered: messages.len() as u64,
            ..Default::default()
        };

        for c in clients {
            for message in &messages {
                let artifact = message_to_artifact(c.id, connection.id, message.uid.to_string(), message);
                match store.upsert_if_newer(&artifact).await {
                    Ok(true) => outcome.created += 1,
                    Ok(false) => outcome.skipped += 1,
                    Err(_) => outcome.errors += 1,
                }
            }
        }

        if let Some(max_uid) = max_uid {
            store
                .upsert_cursor(&PollingCursor {
                    connection_id: connection.id,
                    last_fetched_uid: Some(max_uid),
                    last_etag: None,
                    last_changelog_id: None,
                    updated_at: Some(Utc::now()),
                })
                .await?;
        }

        Ok(outcome)
    }

    async fn test_connection(&self, connection: &Connection) -> Result<()> {
        let ConnectionKind::Imap {
            host,
            port,
            username,
            password,
            use_ssl,
            folder_name,
        } = connection.kind.clone()
        else {
            return Err(SourceError::Permanent("not an imap connection".to_string()));
        };

        tokio::task::spawn_blocking(move || probe_imap_connection(&host, port, &username, &password, use_ssl, &folder_name))
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?
    }
}

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

fn fetch_new_imap_messages(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    use_ssl: bool,
    folder: &str,
    last_uid: u64,
) -> std::result::Result<(Vec<MailMessage>, Option<u64>), SourceError> {
    let mut session: ImapSession = if use_ssl {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| SourceError::Permanent(e.to_string()))?;
        let client = imap::connect((host, port), host, &tls).map_err(|e| SourceError::Transient(e.to_string()))?;
        client
            .login(username, password)
            .map_err(|(e, _)| classify_imap_error(e))?
    } else {
        return Err(SourceError::Permanent("imap connections must use TLS".to_string()));
    };

    session.select(folder).map_err(|e| SourceError::Transient(e.to_string()))?;

    // Server-bug workaround: some IMAP servers return UIDs <= lastFetchedUid
    // in a "since" search; filter them out rather than trusting the server.
    let search = format!("UID {}:*", last_uid + 1);
    let uids = session.uid_search(&search).map_err(|e| SourceError::Transient(e.to_string()))?;
    let mut new_uids: Vec<u64> = uids.into_iter().filter(|u| *u as u64 > last_uid).map(|u| u as u64).collect();
    new_uids.sort_unstable();

    let mut messages = Vec::new();
    let mut max_uid = None;
    for uid in new_uids {
        let fetched = session
            .uid_fetch(uid.to_string(), "RFC822")
            .map_err(|e| SourceError::Transient(e.to_string()))?;
        let Some(m) = fetched.iter().next() else { continue };
        let raw = m.body().unwrap_or(&[]);
        messages.push(parse_message(uid, folder, raw));
        max_uid = Some(max_uid.map_or(uid, |m: u64| m.max(uid)));
    }

    let _ = session.logout();
    Ok((messages, max_uid))
}

/// `testConnection` probe (§4.1): log in and open the configured folder,
/// then immediately log back out without fetching anything.
fn probe_imap_connection(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    use_ssl: bool,
    folder: &str,
) -> std::result::Result<(), SourceError> {
    if !use_ssl {
        return Err(SourceError::Permanent("imap connections must use TLS".to_string()));
    }
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| SourceError::Permanent(e.to_string()))?;
    let client = imap::connect((host, port), host, &tls).map_err(|e| SourceError::Transient(e.to_string()))?;
    let mut session: ImapSession = client.login(username, password).map_err(|(e, _)| classify_imap_error(e))?;
    session.select(folder).map_err(|e| SourceError::Transient(e.to_string()))?;
    let _ = session.logout();
    Ok(())
}

fn classify_imap_error(e: imap::Error) -> SourceError {
    match &e {
        imap::Error::No(msg) if msg.to_lowercase().contains("auth") => SourceError::Auth(msg.clone()),
        other => SourceError::Transient(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// POP3
// ---------------------------------------------------------------------------

pub struct Pop3PollingHandler;

#[async_trait]
impl PollingHandler for Pop3PollingHandler {
    fn can_handle(&self, connection: &Connection) -> bool {
        matches!(connection.kind, ConnectionKind::Pop3 { .. })
    }

    async fn poll(&self, store: &StagingStore, connection: &Connection, clients: &[Client]) -> Result<PollOutcome> {
        let ConnectionKind::Pop3 {
            host,
            port,
            username,
            password,
            use_ssl,
        } = connection.kind.clone()
        else {
            return Err(SourceError::Permanent("not a pop3 connection".to_string()));
        };

        let messages = tokio::task::spawn_blocking(move || fetch_pop3_messages(&host, port, &username, &password, use_ssl))
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))??;

        let mut outcome = PollOutcome {
            discovered: messages.len() as u64,
            ..Default::default()
        };

        for c in clients {
            for message in &messages {
                let source_key = message.message_id.clone();
                let artifact = message_to_artifact(c.id, connection.id, source_key, message);
                match store.upsert_if_newer(&artifact).await {
                    Ok(true) => outcome.created += 1,
                    Ok(false) => outcome.skipped += 1,
                    Err(_) => outcome.errors += 1,
                }
            }
        }

        store
            .upsert_cursor(&PollingCursor {
                connection_id: connection.id,
                last_fetched_uid: None,
                last_etag: None,
                last_changelog_id: None,
                updated_at: Some(Utc::now()),
            })
            .await?;

        Ok(outcome)
    }

    async fn test_connection(&self, connection: &Connection) -> Result<()> {
        let ConnectionKind::Pop3 {
            host,
            port,
            username,
            password,
            use_ssl,
        } = connection.kind.clone()
        else {
            return Err(SourceError::Permanent("not a pop3 connection".to_string()));
        };

        tokio::task::spawn_blocking(move || probe_pop3_connection(&host, port, &username, &password, use_ssl))
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?
    }
}

/// `testConnection` probe (§4.1): authenticate and immediately quit, no
/// `RETR`/`UIDL` calls.
fn probe_pop3_connection(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    use_ssl: bool,
) -> std::result::Result<(), SourceError> {
    if !use_ssl {
        return Err(SourceError::Permanent("pop3 connections must use TLS".to_string()));
    }
    let tcp = TcpStream::connect((host, port)).map_err(|e| SourceError::Transient(e.to_string()))?;
    let connector = native_tls::TlsConnector::new().map_err(|e| SourceError::Permanent(e.to_string()))?;
    let stream = connector.connect(host, tcp).map_err(|e| SourceError::Transient(e.to_string()))?;
    let mut reader = BufReader::new(stream);

    read_pop3_line(&mut reader)?;
    send_pop3_command(&mut reader, &format!("USER {username}"))?;
    send_pop3_command(&mut reader, &format!("PASS {password}"))
        .map_err(|_| SourceError::Auth("pop3 authentication failed".to_string()))?;
    let _ = send_pop3_command(&mut reader, "QUIT");
    Ok(())
}

fn fetch_pop3_messages(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    use_ssl: bool,
) -> std::result::Result<Vec<MailMessage>, SourceError> {
    if !use_ssl {
        return Err(SourceError::Permanent("pop3 connections must use TLS".to_string()));
    }

    let tcp = TcpStream::connect((host, port)).map_err(|e| SourceError::Transient(e.to_string()))?;
    let connector = native_tls::TlsConnector::new().map_err(|e| SourceError::Permanent(e.to_string()))?;
    let stream = connector.connect(host, tcp).map_err(|e| SourceError::Transient(e.to_string()))?;
    let mut reader = BufReader::new(stream);

    read_pop3_line(&mut reader)?;
    send_pop3_command(&mut reader, &format!("USER {username}"))?;
    send_pop3_command(&mut reader, &format!("PASS {password}"))
        .map_err(|_| SourceError::Auth("pop3 authentication failed".to_string()))?;

    let list_reply = send_pop3_multiline(&mut reader, "UIDL")?;
    let mut messages = Vec::new();

    for line in list_reply.lines() {
        let mut parts = line.split_whitespace();
        let Some(index) = parts.next() else { continue };
        let Some(message_id) = parts.next() else { continue };

        let body = send_pop3_multiline(&mut reader, &format!("RETR {index}"))?;
        let mut message = parse_message(0, "INBOX", body.as_bytes());
        message.message_id = message_id.to_string();
        messages.push(message);
    }

    let _ = send_pop3_command(&mut reader, "QUIT");
    Ok(messages)
}

fn read_pop3_line(reader: &mut BufReader<native_tls::TlsStream<TcpStream>>) -> std::result::Result<String, SourceError> {
    let mut line = String::new();
    reader.read_line(&mut line).map_err(|e| SourceError::Transient(e.to_string()))?;
    if !line.starts_with("+OK") {
        return Err(SourceError::Permanent(format!("pop3 error: {line}")));
    }
    Ok(line)
}

fn send_pop3_command(
    reader: &mut BufReader<native_tls::TlsStream<TcpStream>>,
    command: &str,
) -> std::result::Result<String, SourceError> {
    reader
        .get_mut()
        .write_all(format!("{command}\r\n").as_bytes())
        .map_err(|e| SourceError::Transient(e.to_string()))?;
    read_pop3_line(reader)
}

fn send_pop3_multiline(
    reader: &mut BufReader<native_tls::TlsStream<TcpStream>>,
    command: &str,
) -> std::result::Result<String, SourceError> {
    send_pop3_command(reader, command)?;
    let mut body = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).map_err(|e| SourceError::Transient(e.to_string()))?;
        if line.trim_end() == "." {
            break;
        }
        body.push_str(&line);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text_message() {
        let raw = b"From: alice@example.com\r\nTo: bob@example.com\r\nSubject: Hello\r\nMessage-ID: <abc@example.com>\r\n\r\nHi Bob";
        let message = parse_message(42, "INBOX", raw);
        assert_eq!(message.uid, 42);
        assert_eq!(message.from, "alice@example.com");
        assert_eq!(message.subject, "Hello");
        assert!(message.text_body.contains("Hi Bob"));
        assert_eq!(message.message_id, "<abc@example.com>");
    }

    #[test]
    fn generates_message_id_when_absent() {
        let raw = b"From: a@example.com\r\nSubject: no id\r\n\r\nbody";
        let message = parse_message(7, "INBOX", raw);
        assert!(message.message_id.contains("generated-7"));
    }

    #[test]
    fn imap_handler_matches_only_imap_connections() {
        let handler = ImapPollingHandler;
        let imap_conn = Connection::new(
            "mail".to_string(),
            ConnectionKind::Imap {
                host: "imap.example.com".to_string(),
                port: 993,
                username: "u".to_string(),
                password: "p".to_string(),
                use_ssl: true,
                folder_name: "INBOX".to_string(),
            },
        );
        let http_conn = Connection::new(
            "http".to_string(),
            ConnectionKind::Http {
                base_url: "https://example.com".to_string(),
                auth_type: jervis_core::types::AuthType::None,
                credentials: None,
                timeout_ms: 1000,
            },
        );
        assert!(handler.can_handle(&imap_conn));
        assert!(!handler.can_handle(&http_conn));
    }
}
