//! Request and response controls for the change feeds.
//!
//! Content synchronization uses the `ldap3` control types. Persistent
//! search and entry change notifications have no `ldap3` counterpart and
//! are built and read with its ASN.1 layer.
//!
//! The `ldap3` sync parsers panic on malformed input, so every value is
//! checked for shape before it reaches them.

use bytes::BytesMut;
use ldap3::asn1::{
    parse_tag, parse_uint, write, ASNTag, Boolean, Integer, Sequence, StructureTag, Tag,
    TagClass, Types, PL,
};
use ldap3::controls::{
    parse_syncinfo, ControlParser, EntryState, RawControl, RefreshMode, SyncDone, SyncInfo,
    SyncRequest, SyncState,
};
use ldap3::ResultEntry;

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::oids;
use dirsync_connector::types::ChangeKind;

/// Persistent search change type mask covering add, delete, modify and rename.
pub const ALL_CHANGE_TYPES: i64 = 1 | 2 | 4 | 8;

const TAG_INTERMEDIATE_RESPONSE: u64 = 25;

/// Build the persistent search request control.
pub fn persistent_search(
    change_types: i64,
    changes_only: bool,
    return_ecs: bool,
) -> ConnectorResult<RawControl> {
    let value = Tag::Sequence(Sequence {
        inner: vec![
            Tag::Integer(Integer {
                inner: change_types,
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: changes_only,
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: return_ecs,
                ..Default::default()
            }),
        ],
        ..Default::default()
    })
    .into_structure();

    let mut buf = BytesMut::with_capacity(16);
    write::encode_into(&mut buf, value)
        .map_err(|e| ConnectorError::internal(format!("cannot encode persistent search: {e}")))?;
    Ok(RawControl {
        ctype: oids::PERSISTENT_SEARCH.to_string(),
        crit: true,
        val: Some(buf.to_vec()),
    })
}

/// Decoded entry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChangeNotification {
    /// Change kind reported by the server.
    pub kind: ChangeKind,
    /// DN before a rename.
    pub previous_dn: Option<String>,
    /// Server change number.
    pub change_number: Option<i64>,
}

/// Decode an entry change notification control value.
pub fn decode_entry_change(value: &[u8]) -> ConnectorResult<EntryChangeNotification> {
    let mut fields = sequence(value)
        .ok_or_else(|| malformed("entry change notification is not a sequence"))?
        .into_iter();

    let change_type = fields
        .next()
        .filter(|t| is_universal(t, Types::Enumerated as u64))
        .and_then(|t| t.expect_primitive())
        .map(|bytes| unsigned(&bytes))
        .ok_or_else(|| malformed("entry change notification has no change type"))?;
    let kind = i64::try_from(change_type)
        .ok()
        .and_then(ChangeKind::from_psearch_change_type)
        .ok_or_else(|| malformed(&format!("unknown change type {change_type}")))?;

    let mut previous_dn = None;
    let mut change_number = None;
    for field in fields {
        if is_universal(&field, Types::OctetString as u64) && previous_dn.is_none() {
            let bytes = field
                .expect_primitive()
                .ok_or_else(|| malformed("previous DN is constructed"))?;
            previous_dn = Some(
                String::from_utf8(bytes).map_err(|_| malformed("previous DN is not UTF-8"))?,
            );
        } else if is_universal(&field, Types::Integer as u64) {
            let bytes = field
                .expect_primitive()
                .ok_or_else(|| malformed("change number is constructed"))?;
            change_number = i64::try_from(unsigned(&bytes)).ok();
        } else {
            return Err(malformed("unexpected entry change notification field"));
        }
    }

    Ok(EntryChangeNotification {
        kind,
        previous_dn,
        change_number,
    })
}

/// Build the content synchronization request control in
/// refreshAndPersist mode.
#[must_use]
pub fn sync_request(cookie: Option<Vec<u8>>) -> RawControl {
    let mut control: RawControl = SyncRequest {
        mode: RefreshMode::RefreshAndPersist,
        cookie,
        reload_hint: false,
    }
    .into();
    control.crit = true;
    control
}

/// Change kind a sync entry state maps to.
#[must_use]
pub fn entry_state_kind(state: &EntryState) -> ChangeKind {
    match state {
        EntryState::Present => ChangeKind::Seen,
        EntryState::Add => ChangeKind::Add,
        EntryState::Modify => ChangeKind::Modify,
        EntryState::Delete => ChangeKind::Delete,
    }
}

/// Decode a sync state control.
pub fn decode_sync_state(control: &RawControl) -> ConnectorResult<SyncState> {
    let value = control
        .val
        .as_deref()
        .ok_or_else(|| malformed("sync state without value"))?;
    let fields = sequence(value).ok_or_else(|| malformed("sync state is not a sequence"))?;

    let state_ok = fields.first().is_some_and(|t| {
        is_universal(t, Types::Enumerated as u64)
            && primitive(t).is_some_and(|bytes| unsigned(bytes) <= 3)
    });
    if !state_ok {
        return Err(malformed("sync state has no valid state"));
    }
    if fields.len() < 2 || fields.len() > 3 || fields[1..].iter().any(|t| primitive(t).is_none())
    {
        return Err(malformed("sync state has a bad entryUUID or cookie"));
    }

    Ok(SyncState::parse(value))
}

/// Decode a sync done control.
pub fn decode_sync_done(control: &RawControl) -> ConnectorResult<SyncDone> {
    let value = control
        .val
        .as_deref()
        .ok_or_else(|| malformed("sync done without value"))?;
    let fields = sequence(value).ok_or_else(|| malformed("sync done is not a sequence"))?;

    let valid = fields.iter().all(|t| match primitive(t) {
        Some(_) if t.id == Types::OctetString as u64 => true,
        Some(bytes) if t.id == Types::Boolean as u64 => !bytes.is_empty(),
        _ => false,
    });
    if !valid {
        return Err(malformed("sync done has an unexpected component"));
    }

    Ok(SyncDone::parse(value))
}

/// Decode a sync info intermediate response.
pub fn decode_sync_info(entry: ResultEntry) -> ConnectorResult<SyncInfo> {
    check_sync_info(&entry.0)?;
    Ok(parse_syncinfo(entry))
}

/// Cookie carried by a sync info message, if any.
#[must_use]
pub fn sync_info_cookie(info: &SyncInfo) -> Option<&[u8]> {
    match info {
        SyncInfo::NewCookie(cookie) => Some(cookie),
        SyncInfo::RefreshDelete { cookie, .. }
        | SyncInfo::RefreshPresent { cookie, .. }
        | SyncInfo::SyncIdSet { cookie, .. } => cookie.as_deref(),
    }
}

/// Render a sync UUID the way the directory renders `entryUUID`.
#[must_use]
pub fn format_sync_uuid(bytes: &[u8]) -> String {
    match uuid::Uuid::from_slice(bytes) {
        Ok(id) => id.hyphenated().to_string(),
        Err(_) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

fn check_sync_info(message: &StructureTag) -> ConnectorResult<()> {
    if message.id != TAG_INTERMEDIATE_RESPONSE {
        return Err(malformed("not an intermediate response"));
    }
    let PL::C(children) = &message.payload else {
        return Err(malformed("intermediate response is not constructed"));
    };

    let mut value = None;
    for child in children {
        match (child.id, &child.payload) {
            (0, PL::P(name)) if name.as_slice() == oids::SYNC_INFO.as_bytes() => {}
            (1, PL::P(bytes)) => {
                value = Some(bytes);
                break;
            }
            _ => return Err(malformed("intermediate response is not a sync info message")),
        }
    }
    let value = value.ok_or_else(|| malformed("sync info without value"))?;

    let choice = match parse_tag(value) {
        Ok((_, tag)) => tag,
        Err(_) => return Err(malformed("sync info value is not BER")),
    };
    if choice.class != TagClass::Context {
        return Err(malformed("sync info choice is not context tagged"));
    }
    match (choice.id, &choice.payload) {
        (0, PL::P(_)) => Ok(()),
        (1..=3, PL::C(components)) => {
            // Components are ordered cookie, flag, uuid set; each optional.
            let ordered = components.iter().enumerate().all(|(index, component)| {
                let rank = match (component.class, component.id, &component.payload) {
                    (TagClass::Universal, id, PL::P(_)) if id == Types::OctetString as u64 => 1,
                    (TagClass::Universal, id, PL::P(bytes))
                        if id == Types::Boolean as u64 && !bytes.is_empty() =>
                    {
                        2
                    }
                    (TagClass::Universal, id, PL::C(uuids)) if id == Types::Set as u64 => {
                        if uuids.iter().any(|u| primitive(u).is_none()) {
                            return false;
                        }
                        3
                    }
                    _ => return false,
                };
                index < rank
            });
            if ordered {
                Ok(())
            } else {
                Err(malformed("sync info has an unexpected component"))
            }
        }
        _ => Err(malformed("unknown sync info choice")),
    }
}

/// Children of a universal SEQUENCE.
fn sequence(value: &[u8]) -> Option<Vec<StructureTag>> {
    let (_, tag) = parse_tag(value).ok()?;
    tag.match_class(TagClass::Universal)
        .and_then(|t| t.match_id(Types::Sequence as u64))
        .and_then(StructureTag::expect_constructed)
}

fn is_universal(tag: &StructureTag, id: u64) -> bool {
    tag.class == TagClass::Universal && tag.id == id
}

fn primitive(tag: &StructureTag) -> Option<&[u8]> {
    match &tag.payload {
        PL::P(bytes) => Some(bytes),
        PL::C(_) => None,
    }
}

fn unsigned(bytes: &[u8]) -> u64 {
    match parse_uint(bytes) {
        Ok((_, value)) => value,
        Err(_) => 0,
    }
}

fn malformed(message: &str) -> ConnectorError {
    ConnectorError::invalid_data(format!("malformed control value: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap3::asn1::{Enumerated, OctetString, Set};

    fn encode(tag: Tag) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, tag.into_structure()).unwrap();
        buf.to_vec()
    }

    fn enumerated(value: i64) -> Tag {
        Tag::Enumerated(Enumerated {
            inner: value,
            ..Default::default()
        })
    }

    fn octets(value: &[u8]) -> Tag {
        Tag::OctetString(OctetString {
            inner: value.to_vec(),
            ..Default::default()
        })
    }

    fn boolean(value: bool) -> Tag {
        Tag::Boolean(Boolean {
            inner: value,
            ..Default::default()
        })
    }

    fn seq(inner: Vec<Tag>) -> Tag {
        Tag::Sequence(Sequence {
            inner,
            ..Default::default()
        })
    }

    fn response_control(ctype: &str, val: Vec<u8>) -> RawControl {
        RawControl {
            ctype: ctype.to_string(),
            crit: false,
            val: Some(val),
        }
    }

    fn intermediate(value: Tag) -> ResultEntry {
        ResultEntry::new(
            StructureTag {
                class: TagClass::Application,
                id: TAG_INTERMEDIATE_RESPONSE,
                payload: PL::C(vec![
                    StructureTag {
                        class: TagClass::Context,
                        id: 0,
                        payload: PL::P(oids::SYNC_INFO.as_bytes().to_vec()),
                    },
                    StructureTag {
                        class: TagClass::Context,
                        id: 1,
                        payload: PL::P(encode(value)),
                    },
                ]),
            },
        )
    }

    #[test]
    fn test_persistent_search_encoding() {
        let control = persistent_search(ALL_CHANGE_TYPES, true, true).unwrap();
        assert_eq!(control.ctype, "2.16.840.1.113730.3.4.3");
        assert!(control.crit);
        assert_eq!(
            control.val.unwrap(),
            vec![0x30, 0x09, 0x02, 0x01, 0x0f, 0x01, 0x01, 0xff, 0x01, 0x01, 0xff]
        );
    }

    #[test]
    fn test_entry_change_rename() {
        let value = encode(seq(vec![
            enumerated(8),
            octets(b"uid=old,ou=People,dc=example,dc=org"),
            Tag::Integer(Integer {
                inner: 4711,
                ..Default::default()
            }),
        ]));
        let ecn = decode_entry_change(&value).unwrap();
        assert_eq!(ecn.kind, ChangeKind::Rename);
        assert_eq!(
            ecn.previous_dn.as_deref(),
            Some("uid=old,ou=People,dc=example,dc=org")
        );
        assert_eq!(ecn.change_number, Some(4711));
    }

    #[test]
    fn test_entry_change_minimal() {
        let ecn = decode_entry_change(&[0x30, 0x03, 0x0a, 0x01, 0x04]).unwrap();
        assert_eq!(ecn.kind, ChangeKind::Modify);
        assert_eq!(ecn.previous_dn, None);
        assert_eq!(ecn.change_number, None);
    }

    #[test]
    fn test_entry_change_unknown_type() {
        assert!(decode_entry_change(&[0x30, 0x03, 0x0a, 0x01, 0x03]).is_err());
        assert!(decode_entry_change(&[0x04, 0x00]).is_err());
        assert!(decode_entry_change(&[0x30, 0x05]).is_err());
    }

    #[test]
    fn test_sync_request_encoding() {
        let control = sync_request(None);
        assert_eq!(control.ctype, "1.3.6.1.4.1.4203.1.9.1.1");
        assert!(control.crit);
        assert_eq!(control.val.unwrap(), vec![0x30, 0x03, 0x0a, 0x01, 0x03]);

        let control = sync_request(Some(b"rid=001".to_vec()));
        assert_eq!(
            control.val.unwrap(),
            vec![
                0x30, 0x0c, 0x0a, 0x01, 0x03, 0x04, 0x07, b'r', b'i', b'd', b'=', b'0', b'0',
                b'1'
            ]
        );
    }

    #[test]
    fn test_sync_state_decoding() {
        let uuid = [0x11u8; 16];
        let value = encode(seq(vec![enumerated(2), octets(&uuid), octets(b"csn=1")]));
        let state = decode_sync_state(&response_control(oids::SYNC_STATE, value)).unwrap();
        assert_eq!(entry_state_kind(&state.state), ChangeKind::Modify);
        assert_eq!(state.entry_uuid, uuid.to_vec());
        assert_eq!(state.cookie.as_deref(), Some(&b"csn=1"[..]));
    }

    #[test]
    fn test_malformed_sync_state_is_an_error() {
        let bad_state = encode(seq(vec![enumerated(7), octets(&[0u8; 16])]));
        assert!(decode_sync_state(&response_control(oids::SYNC_STATE, bad_state)).is_err());

        let no_uuid = encode(seq(vec![enumerated(1)]));
        assert!(decode_sync_state(&response_control(oids::SYNC_STATE, no_uuid)).is_err());

        let mut no_value = response_control(oids::SYNC_STATE, Vec::new());
        no_value.val = None;
        assert!(decode_sync_state(&no_value).is_err());
    }

    #[test]
    fn test_entry_state_kinds() {
        assert_eq!(entry_state_kind(&EntryState::Present), ChangeKind::Seen);
        assert_eq!(entry_state_kind(&EntryState::Add), ChangeKind::Add);
        assert_eq!(entry_state_kind(&EntryState::Delete), ChangeKind::Delete);
    }

    #[test]
    fn test_sync_done_decoding() {
        let done = decode_sync_done(&response_control(oids::SYNC_DONE, vec![0x30, 0x00])).unwrap();
        assert_eq!(done.cookie, None);
        assert!(!done.refresh_deletes);

        let value = encode(seq(vec![octets(b"c"), boolean(true)]));
        let done = decode_sync_done(&response_control(oids::SYNC_DONE, value)).unwrap();
        assert_eq!(done.cookie.as_deref(), Some(&b"c"[..]));
        assert!(done.refresh_deletes);

        let value = encode(seq(vec![enumerated(1)]));
        assert!(decode_sync_done(&response_control(oids::SYNC_DONE, value)).is_err());
    }

    #[test]
    fn test_sync_info_new_cookie() {
        let value = Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: 0,
            inner: b"c1".to_vec(),
        });
        let info = decode_sync_info(intermediate(value)).unwrap();
        assert!(matches!(&info, SyncInfo::NewCookie(c) if c == b"c1"));
        assert_eq!(sync_info_cookie(&info), Some(&b"c1"[..]));
    }

    #[test]
    fn test_sync_info_id_set() {
        let value = Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: 3,
            inner: vec![
                octets(b"k"),
                boolean(true),
                Tag::Set(Set {
                    inner: vec![octets(&[1u8; 16]), octets(&[2u8; 16])],
                    ..Default::default()
                }),
            ],
        });
        match decode_sync_info(intermediate(value)).unwrap() {
            SyncInfo::SyncIdSet {
                cookie,
                refresh_deletes,
                sync_uuids,
            } => {
                assert_eq!(cookie.as_deref(), Some(&b"k"[..]));
                assert!(refresh_deletes);
                assert_eq!(sync_uuids.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_sync_info_is_an_error() {
        // Flag before cookie.
        let value = Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: 2,
            inner: vec![boolean(true), octets(b"k")],
        });
        assert!(decode_sync_info(intermediate(value)).is_err());

        let value = Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: 7,
            inner: Vec::new(),
        });
        assert!(decode_sync_info(intermediate(value)).is_err());

        let mut entry = intermediate(octets(b"x"));
        entry.0.id = 4;
        assert!(decode_sync_info(entry).is_err());
    }

    #[test]
    fn test_format_sync_uuid() {
        let bytes = [
            0x55, 0x0e, 0x84, 0x00, 0xe2, 0x9b, 0x41, 0xd4, 0xa7, 0x16, 0x44, 0x66, 0x55, 0x44,
            0x00, 0x00,
        ];
        assert_eq!(format_sync_uuid(&bytes), "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(format_sync_uuid(&[0xab, 0x01]), "ab01");
    }
}
