use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use objstream::{
    object_freed, Demux, Error, FrameWriter, HostType, OpaqueValue, Persister, Reader,
    ReaderCallbacks, SerializeFn, Value, Writer, WriterOptions,
};

const READ_TIMEOUT: Duration = Duration::from_millis(5);

fn serialize_fallback() -> SerializeFn {
    Box::new(|value| match value {
        Value::Opaque(opaque) => Ok(format!("<{}>", opaque.kind().name()).into_bytes()),
        Value::Type(typ) => Ok(format!("<type {}>", typ.name()).into_bytes()),
        other => Err(Error::BindError(format!("cannot serialize {:?}", other))),
    })
}

fn callbacks() -> ReaderCallbacks {
    ReaderCallbacks {
        deserialize: Box::new(|bytes| Ok(Value::Pickled(bytes.to_vec()))),
        bind_singleton: Value::str("<pending-bind>"),
        make_stack_delta: Box::new(|to_drop, frames| {
            Value::Tuple(vec![
                Value::Int(to_drop as i64),
                Value::List(
                    frames
                        .into_iter()
                        .map(|(filename, line)| {
                            Value::Tuple(vec![filename, Value::Int(line as i64)])
                        })
                        .collect(),
                ),
            ])
        }),
        make_thread_switch: Box::new(|thread| {
            Value::Tuple(vec![Value::str("<switch>"), thread])
        }),
        make_dropped: None,
    }
}

fn recorder(path: &Path, options: WriterOptions) -> Writer {
    let persister = Persister::create(path, false).unwrap();
    Writer::new(Some(persister), serialize_fallback(), options).unwrap()
}

fn replay(path: &Path) -> Reader {
    Reader::open(path, callbacks(), READ_TIMEOUT, false).unwrap()
}

/// Strip the PID framing, returning the logical byte stream.
fn logical_bytes(path: &Path) -> Vec<u8> {
    let data = std::fs::read(path).unwrap();
    let mut out = Vec::new();
    let mut at = 0;
    while at < data.len() {
        let len = u16::from_le_bytes([data[at + 4], data[at + 5]]) as usize;
        out.extend_from_slice(&data[at + 6..at + 6 + len]);
        at += 6 + len;
    }
    out
}

#[test]
fn minimal_integer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zero.bin");

    let writer = recorder(&path, WriterOptions::default());
    writer.write(&[Value::Int(0)]).unwrap();
    assert_eq!(writer.messages_written(), 1);
    drop(writer);

    assert_eq!(logical_bytes(&path), [0x06]);
    let mut reader = replay(&path);
    assert_eq!(reader.next().unwrap(), Value::Int(0));
    assert_eq!(reader.messages_read(), 1);
}

#[test]
fn negative_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("neg1.bin");

    let writer = recorder(&path, WriterOptions::default());
    writer.write(&[Value::Int(-1)]).unwrap();
    drop(writer);

    assert_eq!(logical_bytes(&path), [0x4E]);
    let mut reader = replay(&path);
    assert_eq!(reader.next().unwrap(), Value::Int(-1));
}

#[test]
fn interned_string_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("interned.bin");
    let abc: Arc<str> = Arc::from("abc");

    let writer = recorder(&path, WriterOptions::default());
    for _ in 0..3 {
        writer.write(&[Value::Str(abc.clone())]).unwrap();
    }
    drop(writer);

    // STR(3) 'a' 'b' 'c' then two STR_REF(0).
    assert_eq!(logical_bytes(&path), [0x34, b'a', b'b', b'c', 0x0F, 0x0F]);

    let mut reader = replay(&path);
    for _ in 0..3 {
        assert_eq!(reader.next().unwrap(), Value::str("abc"));
    }
}

#[test]
fn handle_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("handles.bin");

    let writer = recorder(&path, WriterOptions::default());
    let handle = writer.handle(&Value::str("x"));
    assert_eq!(handle.index(), 0);
    handle.call(&[Value::str("y")]).unwrap();
    drop(handle);
    drop(writer);

    // NEW_HANDLE, STR(1) 'x', HANDLE_REF(0), STR(1) 'y', HANDLE_DELETE(0).
    assert_eq!(
        logical_bytes(&path),
        [0x6E, 0x14, b'x', 0x08, 0x14, b'y', 0x07]
    );

    let mut reader = replay(&path);
    assert_eq!(reader.next().unwrap(), Value::str("x"));
    assert_eq!(reader.handle_value(0), Some(&Value::str("x")));
    assert_eq!(reader.next().unwrap(), Value::str("y"));

    // The trailing delete is consumed before the stream runs dry.
    assert!(matches!(reader.next(), Err(Error::StdioError(_))));
    assert_eq!(reader.handle_count(), 1);
    assert_eq!(reader.handle_value(0), None);
}

#[test]
fn multi_pid_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a.bin");
    let path_b = dir.path().join("b.bin");

    let writer = recorder(&path_a, WriterOptions::default());
    writer
        .write(&[Value::List(vec![Value::Int(1), Value::Int(2)])])
        .unwrap();
    writer.write(&[Value::Int(3)]).unwrap();
    drop(writer);

    let writer = recorder(&path_b, WriterOptions::default());
    writer.write(&[Value::List(vec![Value::str("k")])]).unwrap();
    drop(writer);

    // One shared sink: A's two messages around B's, stamped as pids 100/200.
    let shared = dir.path().join("shared.bin");
    {
        let out = std::fs::File::create(&shared).unwrap();
        let a = logical_bytes(&path_a);
        let split = 3; // LIST(2) UINT(1) UINT(2), then UINT(3)
        FrameWriter::with_pid(out.as_raw_fd(), 100)
            .write(&a[..split])
            .unwrap();
        FrameWriter::with_pid(out.as_raw_fd(), 200)
            .write(&logical_bytes(&path_b))
            .unwrap();
        FrameWriter::with_pid(out.as_raw_fd(), 100)
            .write(&a[split..])
            .unwrap();
    }

    let mut reader = replay(&shared);
    assert_eq!(
        reader.next().unwrap(),
        Value::List(vec![Value::Int(1), Value::Int(2)])
    );
    assert_eq!(reader.active_pid(), 100);
    // B's frame sits between A's two; it must have been buffered.
    assert_eq!(reader.next().unwrap(), Value::Int(3));

    reader.set_active_pid(200);
    assert_eq!(
        reader.next().unwrap(),
        Value::List(vec![Value::str("k")])
    );
}

#[test]
fn thread_switches_key_the_demux() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threads.bin");

    let names = AtomicU64::new(1);
    let options = WriterOptions {
        thread_id: Some(Box::new(move || {
            Value::str(&format!("T{}", names.fetch_add(1, Ordering::Relaxed)))
        })),
        ..WriterOptions::default()
    };

    let writer = Arc::new(recorder(&path, options));
    writer.write(&[Value::str("a")]).unwrap();
    let other = writer.clone();
    thread::spawn(move || other.write(&[Value::str("b")]).unwrap())
        .join()
        .unwrap();
    writer.write(&[Value::str("c")]).unwrap();
    drop(writer);

    // Tag each replayed value with the thread the stream says produced it.
    let mut reader = replay(&path);
    let mut current = Value::None;
    let source = move || loop {
        let value = reader.next()?;
        if let Value::Tuple(items) = &value {
            if items.len() == 2 && items[0] == Value::str("<switch>") {
                current = items[1].clone();
                continue;
            }
        }
        return Ok((current.clone(), value));
    };

    let demux = Arc::new(Demux::new(
        source,
        |item: &(Value, Value)| item.0.clone(),
        Duration::from_secs(5),
    ));

    let t1 = Value::str("T1");

    assert_eq!(demux.next(&t1).unwrap().1, Value::str("a"));
    let for_t2 = demux.clone();
    let got = thread::spawn(move || for_t2.next(&Value::str("T2")).unwrap().1);
    assert_eq!(demux.next(&t1).unwrap().1, Value::str("c"));
    assert_eq!(got.join().unwrap(), Value::str("b"));
}

#[test]
fn bindings_and_free_hooks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bindings.bin");

    let registry_type = Value::Type(HostType::new("Registry", || Value::None));

    let writer = recorder(&path, WriterOptions::default());
    writer.bind(&registry_type).unwrap();
    writer.write(&[registry_type.clone()]).unwrap();
    object_freed(&registry_type);
    writer.write(&[Value::Int(5)]).unwrap();
    drop(writer);

    let mut reader = replay(&path);
    assert_eq!(reader.next().unwrap(), Value::str("<pending-bind>"));
    reader.bind(Value::str("the-registry")).unwrap();
    assert_eq!(reader.next().unwrap(), Value::str("the-registry"));
    // The BINDING_DELETE that follows is consumed on the way to the int.
    assert_eq!(reader.next().unwrap(), Value::Int(5));
    assert_eq!(reader.binding_value(0), None);
}

#[test]
fn ext_bind_reconstructs_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext.bin");

    let widget_type = HostType::new("Widget", || Value::None);
    let widget = Value::Opaque(OpaqueValue::new(widget_type.clone(), 7u8));

    let writer = recorder(&path, WriterOptions::default());
    // ext_bind before the type is bound must fail on the calling thread.
    assert!(matches!(writer.ext_bind(&widget), Err(Error::BindError(_))));

    writer.bind(&Value::Type(widget_type)).unwrap();
    writer.ext_bind(&widget).unwrap();
    writer.write(&[widget.clone()]).unwrap();
    drop(writer);

    let mut reader = replay(&path);
    assert_eq!(reader.next().unwrap(), Value::str("<pending-bind>"));
    reader
        .bind(Value::Type(HostType::new("Widget", || {
            Value::str("rebuilt-widget")
        })))
        .unwrap();
    assert_eq!(reader.next().unwrap(), Value::str("rebuilt-widget"));
    assert_eq!(reader.binding_value(1), Some(&Value::str("rebuilt-widget")));
}

#[test]
fn serializer_fallback_pickles_opaques() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pickle.bin");

    let conn_type = HostType::new("Conn", || Value::None);
    let conn = Value::Opaque(OpaqueValue::new(conn_type, ()));

    let writer = recorder(&path, WriterOptions::default());
    writer.write(&[conn]).unwrap();
    drop(writer);

    let mut reader = replay(&path);
    assert_eq!(
        reader.next().unwrap(),
        Value::Pickled(b"<Conn>".to_vec())
    );
}

#[test]
fn stack_deltas_replay_incrementally() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.bin");

    let main_py: Arc<str> = Arc::from("main.py");
    let util_py: Arc<str> = Arc::from("util.py");

    let writer = recorder(&path, WriterOptions::default());
    writer
        .write_stack(0, &[(main_py.clone(), 10), (util_py.clone(), 20)])
        .unwrap();
    writer.write_stack(1, &[(main_py, 11)]).unwrap();
    drop(writer);

    let mut reader = replay(&path);
    assert_eq!(
        reader.next().unwrap(),
        Value::Tuple(vec![
            Value::Int(0),
            Value::List(vec![
                Value::Tuple(vec![Value::str("main.py"), Value::Int(10)]),
                Value::Tuple(vec![Value::str("util.py"), Value::Int(20)]),
            ]),
        ])
    );
    assert_eq!(
        reader.next().unwrap(),
        Value::Tuple(vec![
            Value::Int(1),
            Value::List(vec![Value::Tuple(vec![
                Value::str("main.py"),
                Value::Int(11)
            ])]),
        ])
    );
}

#[test]
fn preamble_and_enable_gate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gated.bin");

    let armed = Arc::new(AtomicBool::new(false));
    let gate = armed.clone();
    let options = WriterOptions {
        preamble: Some(Value::str("header")),
        enable_when: Some(Box::new(move || gate.load(Ordering::Relaxed))),
        ..WriterOptions::default()
    };

    let writer = recorder(&path, options);
    writer.write(&[Value::str("skipped")]).unwrap();
    armed.store(true, Ordering::Relaxed);
    writer.write(&[Value::str("recorded")]).unwrap();
    drop(writer);

    let mut reader = replay(&path);
    assert_eq!(reader.next().unwrap(), Value::str("header"));
    assert_eq!(reader.next().unwrap(), Value::str("recorded"));
    assert!(matches!(reader.next(), Err(Error::StdioError(_))));
}

#[test]
fn magic_markers_frame_each_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("magic.bin");

    let options = WriterOptions {
        magic_markers: true,
        ..WriterOptions::default()
    };
    let writer = recorder(&path, options);
    writer
        .write(&[Value::Int(1), Value::str("two"), Value::Float(3.0)])
        .unwrap();
    drop(writer);

    let mut reader = replay(&path);
    reader.set_magic_markers(true);
    assert_eq!(reader.next().unwrap(), Value::Int(1));
    assert_eq!(reader.next().unwrap(), Value::str("two"));
    assert_eq!(reader.next().unwrap(), Value::Float(3.0));
}

#[test]
fn nested_values_survive_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested.bin");

    let value = Value::Dict(vec![
        (
            Value::str("config"),
            Value::List(vec![Value::Int(1), Value::Int(-200), Value::None]),
        ),
        (
            Value::str("flags"),
            Value::Tuple(vec![Value::Bool(true), Value::Bool(false)]),
        ),
        (Value::str("blob"), Value::Bytes(vec![0, 255, 128])),
        (
            Value::str("big"),
            Value::BigInt(vec![0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
        ),
    ]);

    let writer = recorder(&path, WriterOptions::default());
    writer.write(&[value.clone()]).unwrap();
    drop(writer);

    let mut reader = replay(&path);
    assert_eq!(reader.next().unwrap(), value);
}

#[test]
fn counters_track_the_drain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counters.bin");

    let writer = recorder(&path, WriterOptions::default());
    writer.write(&[Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(writer.messages_written(), 2);
    assert_eq!(writer.dropped_messages(), 0);
    writer.flush();

    let deadline = Instant::now() + Duration::from_secs(5);
    while writer.bytes_written() < 2 {
        assert!(Instant::now() < deadline, "drain never reached the sink");
        thread::sleep(Duration::from_millis(1));
    }
    drop(writer);
    assert_eq!(logical_bytes(&path).len(), 2);
}
