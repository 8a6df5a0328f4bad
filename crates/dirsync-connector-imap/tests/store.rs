//! ImapMailStore against a scripted in-memory server.

use dirsync_connector::operation::AclEntry;
use dirsync_connector::traits::MailStore;
use dirsync_connector_imap::{ImapConfig, ImapMailStore};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufStream, DuplexStream};
use tokio::task::JoinHandle;

type Exchange = (&'static str, Vec<&'static str>);

fn login() -> Exchange {
    (r#"LOGIN "cyrus-admin" "secret""#, vec!["{tag} OK Logged in"])
}

/// Serve `script` in order: each command (without tag) must match, then
/// the responses are sent with `{tag}` replaced.
fn serve(stream: DuplexStream, script: Vec<Exchange>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = BufStream::new(stream);
        stream
            .write_all(b"* OK [CAPABILITY IMAP4rev1 ACL QUOTA METADATA] ready\r\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();

        for (expected, responses) in script {
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            let (tag, command) = line.trim_end().split_once(' ').unwrap();
            assert_eq!(command, expected);
            for response in responses {
                let response = response.replace("{tag}", tag);
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.write_all(b"\r\n").await.unwrap();
            }
            stream.flush().await.unwrap();
        }
    })
}

async fn store(script: Vec<Exchange>) -> (ImapMailStore, JoinHandle<()>) {
    let (client, server) = duplex(8192);
    let mut full = vec![login()];
    full.extend(script);
    let handle = serve(server, full);
    let config = ImapConfig::new("imap.example.org", "cyrus-admin").with_password("secret");
    let store = ImapMailStore::from_stream(config, client).await.unwrap();
    (store, handle)
}

#[tokio::test]
async fn test_create_existing_mailbox_succeeds() {
    let (store, server) = store(vec![(
        r#"CREATE "user/jdoe@example.org""#,
        vec!["{tag} NO [ALREADYEXISTS] Mailbox already exists"],
    )])
    .await;

    store
        .create_mailbox("user/jdoe@example.org", None)
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_create_on_partition() {
    let (store, server) = store(vec![(
        r#"CREATE "shared/sales@example.org" "imap2""#,
        vec!["{tag} OK Completed"],
    )])
    .await;

    store
        .create_mailbox("shared/sales@example.org", Some("imap2"))
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_delete_missing_mailbox_succeeds() {
    let (store, server) = store(vec![(
        r#"DELETE "user/gone@example.org""#,
        vec!["{tag} NO [NONEXISTENT] Mailbox does not exist"],
    )])
    .await;

    store.delete_mailbox("user/gone@example.org").await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_delete_grants_admin_rights_when_denied() {
    let (store, server) = store(vec![
        (
            r#"DELETE "shared/old@example.org""#,
            vec!["{tag} NO [NOPERM] Permission denied"],
        ),
        (
            r#"SETACL "shared/old@example.org" "cyrus-admin" "x""#,
            vec!["{tag} OK Completed"],
        ),
        (r#"DELETE "shared/old@example.org""#, vec!["{tag} OK Completed"]),
    ])
    .await;

    store.delete_mailbox("shared/old@example.org").await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_mailbox_exists_and_list() {
    let (store, server) = store(vec![
        (
            r#"LIST "" "user/jdoe@example.org""#,
            vec![
                r#"* LIST (\HasChildren) "/" "user/jdoe@example.org""#,
                "{tag} OK Completed",
            ],
        ),
        (
            r#"LIST "" "user/nobody@example.org""#,
            vec!["{tag} OK Completed"],
        ),
        (
            r#"LIST "" "user/jdoe/*@example.org""#,
            vec![
                r#"* LIST (\HasNoChildren) "/" "user/jdoe/Calendar@example.org""#,
                r#"* LIST (\HasNoChildren) "/" "user/jdoe/Contacts@example.org""#,
                "{tag} OK Completed",
            ],
        ),
    ])
    .await;

    assert!(store.mailbox_exists("user/jdoe@example.org").await.unwrap());
    assert!(!store.mailbox_exists("user/nobody@example.org").await.unwrap());
    assert_eq!(
        store.list_mailboxes("user/jdoe/*@example.org").await.unwrap(),
        vec![
            "user/jdoe/Calendar@example.org",
            "user/jdoe/Contacts@example.org"
        ]
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_acl_round_trip() {
    let (store, server) = store(vec![
        (
            r#"GETACL "shared/sales@example.org""#,
            vec![
                r#"* ACL "shared/sales@example.org" anyone p jdoe@example.org lrs"#,
                "{tag} OK Completed",
            ],
        ),
        (
            r#"SETACL "shared/sales@example.org" "jdoe@example.org" "lrswite""#,
            vec!["{tag} OK Completed"],
        ),
        (
            r#"DELETEACL "shared/sales@example.org" "anyone""#,
            vec!["{tag} OK Completed"],
        ),
    ])
    .await;

    let acl = store.get_acl("shared/sales@example.org").await.unwrap();
    assert_eq!(
        acl,
        vec![
            AclEntry::new("anyone", "p"),
            AclEntry::new("jdoe@example.org", "lrs")
        ]
    );
    store
        .set_acl("shared/sales@example.org", "jdoe@example.org", "lrswite")
        .await
        .unwrap();
    store
        .set_acl("shared/sales@example.org", "anyone", "")
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_metadata_and_host() {
    let (store, server) = store(vec![
        (
            r#"GETMETADATA "user/jdoe@example.org" "/shared/vendor/cmu/cyrus-imapd/server""#,
            vec![
                r#"* METADATA "user/jdoe@example.org" (/shared/vendor/cmu/cyrus-imapd/server {17}"#,
                r#"imap1.example.org)"#,
                "{tag} OK Completed",
            ],
        ),
        (
            r#"SETMETADATA "user/jdoe/Calendar@example.org" ("/private/vendor/kolab/folder-type" "event.default")"#,
            vec!["{tag} OK Completed"],
        ),
    ])
    .await;

    assert_eq!(
        store
            .mailbox_host("user/jdoe@example.org")
            .await
            .unwrap()
            .as_deref(),
        Some("imap1.example.org")
    );
    store
        .set_metadata(
            "user/jdoe/Calendar@example.org",
            "/private/vendor/kolab/folder-type",
            "event.default",
        )
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_quota() {
    let (store, server) = store(vec![
        (
            r#"GETQUOTAROOT "user/jdoe@example.org""#,
            vec![
                r#"* QUOTAROOT "user/jdoe@example.org" "user/jdoe@example.org""#,
                r#"* QUOTA "user/jdoe@example.org" (STORAGE 512 1048576)"#,
                "{tag} OK Completed",
            ],
        ),
        (
            r#"SETQUOTA "user/jdoe@example.org" (STORAGE 2097152)"#,
            vec!["{tag} OK Completed"],
        ),
        (
            r#"GETQUOTAROOT "user/new@example.org""#,
            vec![
                r#"* QUOTAROOT "user/new@example.org""#,
                "{tag} OK Completed",
            ],
        ),
    ])
    .await;

    assert_eq!(
        store.get_quota("user/jdoe@example.org").await.unwrap(),
        Some(1_048_576)
    );
    store
        .set_quota("user/jdoe@example.org", 2_097_152)
        .await
        .unwrap();
    assert_eq!(store.get_quota("user/new@example.org").await.unwrap(), None);
    server.await.unwrap();
}

#[tokio::test]
async fn test_rename_failure_is_reported() {
    let (store, server) = store(vec![(
        r#"RENAME "user/a@example.org" "user/b@example.org""#,
        vec!["{tag} NO [NONEXISTENT] Mailbox does not exist"],
    )])
    .await;

    let err = store
        .rename_mailbox("user/a@example.org", "user/b@example.org", None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    server.await.unwrap();
}

#[tokio::test]
async fn test_dropped_server_is_transient() {
    let (store, server) = store(Vec::new()).await;
    server.await.unwrap();

    let err = store.get_acl("user/jdoe@example.org").await.unwrap_err();
    assert!(err.is_transient());
}
