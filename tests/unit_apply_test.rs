use bytes::Bytes;
use riptide::core::snapshot::apply::restore_commands;
use riptide::core::snapshot::entry::{
    RdbEntry, RdbTypeTag, RdbValue, StreamEntry, StreamValue, ZSetEntry,
};

fn entry(value: RdbValue) -> RdbEntry {
    RdbEntry {
        key: Bytes::from_static(b"k"),
        type_tag: RdbTypeTag::String,
        value,
        expire_at_ms: None,
        db_index: 0,
    }
}

fn args_as_strings(cmd: &[Bytes]) -> Vec<String> {
    cmd.iter()
        .map(|a| String::from_utf8_lossy(a).to_string())
        .collect()
}

#[test]
fn test_string_becomes_set() {
    let commands = restore_commands(&entry(RdbValue::String(Bytes::from_static(b"v"))), 512);
    assert_eq!(commands.len(), 1);
    assert_eq!(args_as_strings(&commands[0]), vec!["SET", "k", "v"]);
}

#[test]
fn test_expiry_appends_pexpireat() {
    let mut e = entry(RdbValue::String(Bytes::from_static(b"v")));
    e.expire_at_ms = Some(1_700_000_000_000);
    let commands = restore_commands(&e, 512);
    assert_eq!(commands.len(), 2);
    assert_eq!(
        args_as_strings(&commands[1]),
        vec!["PEXPIREAT", "k", "1700000000000"]
    );
}

#[test]
fn test_list_chunks_split_large_collections() {
    let items: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("item{i}"))).collect();
    let commands = restore_commands(&entry(RdbValue::List(items)), 2);
    // 5 items in chunks of 2: three RPUSH commands.
    assert_eq!(commands.len(), 3);
    for cmd in &commands {
        assert_eq!(cmd[0], Bytes::from_static(b"RPUSH"));
        assert_eq!(cmd[1], Bytes::from_static(b"k"));
    }
    assert_eq!(commands[0].len(), 4);
    assert_eq!(commands[2].len(), 3);
}

#[test]
fn test_hash_flattens_pairs() {
    let pairs = vec![
        (Bytes::from_static(b"f1"), Bytes::from_static(b"v1")),
        (Bytes::from_static(b"f2"), Bytes::from_static(b"v2")),
    ];
    let commands = restore_commands(&entry(RdbValue::Hash(pairs)), 512);
    assert_eq!(
        args_as_strings(&commands[0]),
        vec!["HSET", "k", "f1", "v1", "f2", "v2"]
    );
}

#[test]
fn test_zset_scores_precede_members() {
    let zset = vec![
        ZSetEntry {
            member: Bytes::from_static(b"a"),
            score: 1.5,
        },
        ZSetEntry {
            member: Bytes::from_static(b"b"),
            score: f64::INFINITY,
        },
    ];
    let commands = restore_commands(&entry(RdbValue::ZSet(zset)), 512);
    assert_eq!(
        args_as_strings(&commands[0]),
        vec!["ZADD", "k", "1.5", "a", "+inf", "b"]
    );
}

#[test]
fn test_stream_entries_become_xadd_with_explicit_ids() {
    let stream = StreamValue {
        entries: vec![StreamEntry {
            id_ms: 1111,
            id_seq: 7,
            fields: vec![(Bytes::from_static(b"temp"), Bytes::from_static(b"21"))],
        }],
        last_id_ms: 1111,
        last_id_seq: 7,
    };
    let commands = restore_commands(&entry(RdbValue::Stream(stream)), 512);
    assert_eq!(
        args_as_strings(&commands[0]),
        vec!["XADD", "k", "1111-7", "temp", "21"]
    );
}

#[test]
fn test_empty_collection_produces_no_commands() {
    let commands = restore_commands(&entry(RdbValue::Set(Vec::new())), 512);
    assert!(commands.is_empty());

    // No value commands means no dangling PEXPIREAT either.
    let mut e = entry(RdbValue::List(Vec::new()));
    e.expire_at_ms = Some(1_700_000_000_000);
    assert!(restore_commands(&e, 512).is_empty());
}
