use std::sync::Arc;

use tgupload_core::file::MB;
use tgupload_core::web::DIGEST_STEP;
use tgupload_core::{
    Error, FileKind, FullMsgId, HttpTransport, InMemoryRegistry, InputFile, MediaDescriptor,
    RequestId, SessionContext, UploadEvent, Uploader, UploadingState, WebCall, WebRequest,
    WebStrategy,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeHttp {
    next: RequestId,
    posts: Vec<(RequestId, WebRequest)>,
    cancelled: Vec<RequestId>,
}

impl HttpTransport for FakeHttp {
    fn post(&mut self, request: WebRequest) -> RequestId {
        self.next += 1;
        self.posts.push((self.next, request));
        self.next
    }

    fn cancel(&mut self, request: RequestId) {
        self.cancelled.push(request);
    }
}

type WebUploader = Uploader<WebStrategy<FakeHttp>>;

fn harness() -> (
    WebUploader,
    Arc<InMemoryRegistry>,
    mpsc::UnboundedReceiver<UploadEvent>,
) {
    let registry = Arc::new(InMemoryRegistry::new());
    let strategy = WebStrategy::new(FakeHttp::default(), SessionContext::new(77, "tok-1"));
    let mut uploader = Uploader::new(strategy, registry.clone(), registry.clone());
    let events = uploader.subscribe();
    (uploader, registry, events)
}

fn http(uploader: &mut WebUploader) -> &mut FakeHttp {
    uploader.strategy_mut().transport_mut()
}

fn last_post(uploader: &mut WebUploader) -> (RequestId, WebRequest) {
    http(uploader).posts.last().cloned().unwrap()
}

fn reply(uploader: &mut WebUploader, body: &str) {
    let (id, _) = last_post(uploader);
    uploader.on_response(id, Ok(body.as_bytes().to_vec()));
}

fn drain(events: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

fn msg(n: i32) -> FullMsgId {
    FullMsgId::new(-5, n)
}

const VERIFY_OK: &str = r#"{"error":0,"file_name":"Report.PDF","file_url_prefix":"https://cdn.example.org/","path":"u/77/abc"}"#;

#[test]
fn parts_are_posted_one_at_a_time_with_one_based_index() {
    let (mut uploader, _registry, _events) = harness();
    let data = pattern(3 * MB);
    let md5 = format!("{:x}", md5::compute(&data));
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::File, 1, "Report.PDF", data.clone()),
    );

    for index in 1..=3usize {
        let (_, req) = last_post(&mut uploader);
        assert_eq!(http(&mut uploader).posts.len(), index);
        assert_eq!(req.call, WebCall::UploadPart);
        assert_eq!(req.field("uid"), Some("77"));
        assert_eq!(req.field("token"), Some("tok-1"));
        assert_eq!(req.field("md5"), Some(md5.as_str()));
        assert_eq!(req.field("type"), Some("pdf"));
        assert_eq!(req.field("total"), Some("3"));
        assert_eq!(req.field("index"), Some(index.to_string().as_str()));

        let file = req.file.unwrap();
        assert_eq!(file.name, "Report.PDF");
        assert_eq!(file.bytes, data[(index - 1) * MB..index * MB]);

        reply(&mut uploader, r#"{"error":0}"#);
    }

    let (_, verify) = last_post(&mut uploader);
    assert_eq!(verify.call, WebCall::Verify);
    assert_eq!(verify.field("index"), None);
    assert_eq!(verify.field("total"), Some("3"));
    assert!(verify.file.is_none());
}

#[test]
fn server_error_on_second_part_fails_without_retry() {
    let (mut uploader, registry, mut events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::File, 9, "Report.PDF", pattern(3 * MB)),
    );
    reply(&mut uploader, r#"{"error":0}"#);
    reply(&mut uploader, r#"{"error":5,"message":"bad part"}"#);

    assert_eq!(http(&mut uploader).posts.len(), 2);
    let events = drain(&mut events);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0],
        UploadEvent::DocumentProgress { sent, total, .. } if sent == MB as u64 && total == 3 * MB as u64
    ));
    match &events[1] {
        UploadEvent::DocumentFailed { msg_id, error } => {
            assert_eq!(*msg_id, msg(1));
            assert!(error.contains("bad part"), "{error}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(registry.state(9), Some(UploadingState::Failed));
    assert_eq!(uploader.current(), None);
}

#[test]
fn verify_response_becomes_url_handle() {
    let (mut uploader, registry, mut events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::File, 2, "Report.PDF", pattern(3 * MB)),
    );
    for _ in 0..3 {
        reply(&mut uploader, r#"{"error":0}"#);
    }
    reply(&mut uploader, VERIFY_OK);

    let events = drain(&mut events);
    assert_eq!(events.len(), 4);
    assert_eq!(
        events[3],
        UploadEvent::DocumentReady {
            msg_id: msg(1),
            file: InputFile::Url {
                url: "https://cdn.example.org/u/77/abc".to_string(),
                name: "Report.PDF".to_string(),
            },
        }
    );
    assert_eq!(registry.state(2), Some(UploadingState::Done));
    assert_eq!(http(&mut uploader).posts.len(), 4);
}

#[test]
fn malformed_response_fails_the_file() {
    for body in ["<html>502</html>", r#"{"status":"ok"}"#, r#"{"error":"0"}"#] {
        let (mut uploader, _registry, mut events) = harness();
        uploader.upload_media(
            msg(1),
            MediaDescriptor::from_bytes(FileKind::Audio, 1, "a.mp3", pattern(MB / 2)),
        );
        reply(&mut uploader, body);
        assert!(
            matches!(
                drain(&mut events).last(),
                Some(UploadEvent::DocumentFailed { .. })
            ),
            "body={body}"
        );
    }
}

#[test]
fn verify_without_location_fails() {
    let (mut uploader, _registry, mut events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::Photo, 1, "p.png", pattern(1000)),
    );
    reply(&mut uploader, r#"{"error":0}"#);
    reply(&mut uploader, r#"{"error":0}"#);

    assert!(matches!(
        drain(&mut events).last(),
        Some(UploadEvent::PhotoFailed { .. })
    ));
}

#[test]
fn photo_uses_fixed_wire_name_and_extension_type() {
    let (mut uploader, _registry, _events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::Photo, 1, "Shot.PNG", pattern(1000)),
    );
    let (_, req) = last_post(&mut uploader);
    assert_eq!(req.field("type"), Some("png"));
    assert_eq!(req.file.unwrap().name, "file.jpg");

    let (mut uploader, _registry, _events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::File, 1, "README", pattern(10)),
    );
    let (_, req) = last_post(&mut uploader);
    assert_eq!(req.field("type"), Some("bin"));
}

#[test]
fn thumbnail_is_dropped() {
    let (mut uploader, _registry, mut events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::File, 1, "Report.PDF", pattern(1000))
            .with_thumbnail(pattern(2000)),
    );
    assert_eq!(http(&mut uploader).posts.len(), 1);
    reply(&mut uploader, r#"{"error":0}"#);
    reply(&mut uploader, VERIFY_OK);

    assert!(matches!(
        drain(&mut events).last(),
        Some(UploadEvent::DocumentReady { .. })
    ));
}

#[test]
fn transport_error_fails_and_stale_replies_are_ignored() {
    let (mut uploader, _registry, mut events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::File, 1, "a.bin", pattern(2 * MB)),
    );
    uploader.on_response(999, Ok(br#"{"error":0}"#.to_vec()));
    assert!(drain(&mut events).is_empty());

    let (id, _) = last_post(&mut uploader);
    uploader.on_response(
        id,
        Err(Error::Http {
            message: "http 502 Bad Gateway: oops".to_string(),
        }),
    );
    let seen = drain(&mut events);
    assert!(matches!(seen.as_slice(), [UploadEvent::DocumentFailed { .. }]));

    uploader.on_response(id, Ok(br#"{"error":0}"#.to_vec()));
    assert!(drain(&mut events).is_empty());
    assert_eq!(http(&mut uploader).posts.len(), 1);
}

#[test]
fn cancel_aborts_outstanding_post_and_starts_next_file() {
    let (mut uploader, _registry, mut events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_bytes(FileKind::File, 1, "a.bin", pattern(2 * MB)),
    );
    uploader.upload_media(
        msg(2),
        MediaDescriptor::from_bytes(FileKind::File, 2, "b.txt", pattern(100)),
    );
    let (first, _) = last_post(&mut uploader);

    uploader.cancel(msg(1));

    assert_eq!(http(&mut uploader).cancelled, vec![first]);
    assert_eq!(uploader.current(), Some(msg(2)));
    let (_, req) = last_post(&mut uploader);
    assert_eq!(req.field("type"), Some("txt"));
    assert_eq!(req.field("index"), Some("1"));

    let seen = drain(&mut events);
    assert!(matches!(
        seen.as_slice(),
        [UploadEvent::DocumentFailed { msg_id, .. }] if *msg_id == msg(1)
    ));
}

#[test]
fn digest_and_parts_cover_declared_size_only() {
    let (mut uploader, _registry, _events) = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.bin");
    let data = pattern(100);
    std::fs::write(&path, &data).unwrap();

    uploader.upload_media(msg(1), MediaDescriptor::from_path(FileKind::File, 1, path, 50));

    let (_, req) = last_post(&mut uploader);
    let md5 = format!("{:x}", md5::compute(&data[..50]));
    assert_eq!(req.field("md5"), Some(md5.as_str()));
    assert_eq!(req.file.unwrap().bytes, data[..50]);
}

#[test]
fn source_shorter_than_declared_size_fails_before_posting() {
    let (mut uploader, registry, mut events) = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.bin");
    std::fs::write(&path, pattern(100)).unwrap();

    uploader.upload_media(msg(1), MediaDescriptor::from_path(FileKind::File, 3, path, 200));

    assert!(http(&mut uploader).posts.is_empty());
    match drain(&mut events).as_slice() {
        [UploadEvent::DocumentFailed { msg_id, error }] => {
            assert_eq!(*msg_id, msg(1));
            assert!(error.contains("cut.bin"), "{error}");
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(registry.state(3), Some(UploadingState::Failed));
}

#[test]
fn large_file_is_hashed_across_passes_and_can_be_cancelled_meanwhile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.iso");
    let size = 2 * DIGEST_STEP + MB as u64;
    std::fs::File::create(&path).unwrap().set_len(size).unwrap();

    let (mut uploader, _registry, _events) = harness();
    uploader.upload_media(
        msg(1),
        MediaDescriptor::from_path(FileKind::File, 1, path.clone(), size),
    );
    assert!(http(&mut uploader).posts.is_empty());
    uploader.send_next();
    assert!(http(&mut uploader).posts.is_empty());
    uploader.send_next();

    let (_, req) = last_post(&mut uploader);
    let md5 = format!("{:x}", md5::compute(vec![0u8; size as usize]));
    assert_eq!(req.field("md5"), Some(md5.as_str()));
    assert_eq!(req.field("index"), Some("1"));

    let (mut uploader, _registry, mut events) = harness();
    uploader.upload_media(msg(2), MediaDescriptor::from_path(FileKind::File, 2, path, size));
    uploader.cancel(msg(2));

    assert!(http(&mut uploader).posts.is_empty());
    assert!(http(&mut uploader).cancelled.is_empty());
    assert!(matches!(
        drain(&mut events).as_slice(),
        [UploadEvent::DocumentFailed { msg_id, .. }] if *msg_id == msg(2)
    ));
    assert_eq!(uploader.current(), None);
}
