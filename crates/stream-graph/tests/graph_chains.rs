//! End-to-end chains through the mapper: file source → converter, dropping
//! over a published stream, and the close protocol.

use std::sync::Arc;
use std::time::Duration;

use media_tag::{Request, Tag, TagKind, TagPayload};
use serde_json::json;
use stream_graph::elements::publishing::PublishingElement;
use stream_graph::library::{ElementSpec, MediaLibrary};
use stream_graph::rpc::RpcRegistry;
use stream_graph::state::StateKeeper;
use stream_graph::ElementMapper;

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

async fn recv_until_eos(rx: kanal::Receiver<Tag>) -> Vec<Tag> {
    let rx = rx.to_async();
    let mut out = Vec::new();
    loop {
        let tag = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("stream stalled")
            .expect("channel closed");
        let is_eos = tag.is_eos();
        out.push(tag);
        if is_eos {
            return out;
        }
    }
}

fn library() -> (Arc<MediaLibrary>, Arc<ElementMapper>) {
    let mapper = ElementMapper::new();
    let library = MediaLibrary::new(mapper.clone(), StateKeeper::new(), RpcRegistry::new());
    (library, mapper)
}

#[tokio::test]
async fn file_to_flv_conversion_chain() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("clip.f4v"),
        f4v::test_support::build_movie_file(&[32, 16, 24], 40, &[0, 2], true),
    )
    .unwrap();

    let (library, mapper) = library();
    library
        .add_element(serde_json::from_value(json!({
            "type": "aio_file",
            "name": "files",
            "root_dir": dir.path(),
            "path_regex": ".*\\.f4v$",
        })).unwrap())
        .unwrap();
    library
        .add_element(ElementSpec::F4vToFlvConverter {
            name: "flv".to_string(),
        })
        .unwrap();

    let req = Request::new();
    let (tx, rx) = kanal::unbounded();
    assert!(mapper.add_request("flv/files/clip.f4v", &req, tx));

    let tags = recv_until_eos(rx).await;
    let kinds: Vec<TagKind> = tags.iter().map(Tag::kind).collect();

    assert_eq!(kinds.first(), Some(&TagKind::SourceStarted));
    assert!(kinds.contains(&TagKind::MediaInfo));

    // Each of the two keyframes gets a cue point right before its FLV tag,
    // numbered monotonically from zero.
    let mut cue_numbers = Vec::new();
    for (i, tag) in tags.iter().enumerate() {
        if let TagPayload::CuePoint(cue) = &tag.payload {
            if let media_tag::CuePointData::Marker { number } = **cue {
                cue_numbers.push(number);
                assert_eq!(tags[i + 1].kind(), TagKind::VideoFrame);
                assert!(tags[i + 1].can_resync());
            }
        }
    }
    assert_eq!(cue_numbers, vec![0, 1]);

    // All three frames came out as FLV video tags.
    let frames = tags
        .iter()
        .filter(|t| t.kind() == TagKind::VideoFrame && !t.is_metadata())
        .count();
    assert_eq!(frames, 3);
}

#[tokio::test]
async fn dropping_over_a_published_stream() {
    let (library, mapper) = library();
    let publishing = PublishingElement::new("pub");
    mapper.register(publishing.clone());
    library
        .add_element(serde_json::from_value(json!({
            "type": "dropping",
            "name": "drop",
            "audio_accept_period_ms": 1000,
            "audio_drop_period_ms": 1000,
            "video_accept_period_ms": 1000,
            "video_drop_period_ms": 1000,
        })).unwrap())
        .unwrap();

    let req = Request::new();
    let (tx, rx) = kanal::unbounded();
    assert!(mapper.add_request("drop/pub/cam", &req, tx));

    let handle = publishing.publish("cam").expect("publish");
    let video = |ts: i64, key: bool| {
        let attrs = if key {
            media_tag::TagAttributes::CAN_RESYNC
        } else {
            media_tag::TagAttributes::empty()
        };
        Tag::new(
            media_tag::DEFAULT_FLAVOUR_MASK,
            TagPayload::Frame(media_tag::MediaFrame {
                kind: media_tag::MediaFrameKind::Video,
                format: media_tag::MediaFormat::Flv,
                is_keyframe: key,
                data: bytes::Bytes::from_static(&[0x17, 0x01]),
            }),
        )
        .with_attributes(attrs)
        .with_timestamp(ts)
    };

    // Ten keyframes inside the accept window, ten interframes past it, and
    // one keyframe that reopens the window.
    for i in 0..10 {
        handle.push(video(i * 100, true));
    }
    for i in 10..20 {
        handle.push(video(i * 100, false));
    }
    handle.push(video(2000, true));
    settle().await;

    let forwarded: Vec<i64> = {
        let mut tags = Vec::new();
        while let Ok(Some(tag)) = rx.try_recv() {
            if tag.kind() == TagKind::VideoFrame {
                tags.push(tag.timestamp_ms);
            }
        }
        tags
    };
    let mut expected: Vec<i64> = (0..10).map(|i| i * 100).collect();
    expected.push(2000);
    assert_eq!(forwarded, expected);
}

#[tokio::test]
async fn close_all_delivers_one_eos_per_live_request() {
    let (library, mapper) = library();
    let publishing = PublishingElement::new("pub");
    mapper.register(publishing.clone());
    library
        .add_element(ElementSpec::Normalizing {
            name: "norm".to_string(),
            write_ahead_ms: 0,
        })
        .unwrap();

    // A well-behaved client answers its EOS with remove_request.
    let client = |path: &str| {
        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request(path, &req, tx));
        let mapper = mapper.clone();
        let path = path.to_string();
        let req_id = req.id();
        tokio::spawn(async move {
            let rx = rx.to_async();
            let mut eos = 0;
            while let Ok(tag) = rx.recv().await {
                if tag.is_eos() {
                    eos += 1;
                    mapper.remove_request(&path, req_id);
                    break;
                }
            }
            eos
        })
    };
    let filtered = client("norm/pub/cam");
    let direct = client("pub/cam");

    tokio::time::timeout(Duration::from_secs(5), mapper.close_all())
        .await
        .expect("close_all stalled");

    assert_eq!(filtered.await.unwrap(), 1, "exactly one EOS per request");
    assert_eq!(direct.await.unwrap(), 1, "exactly one EOS per request");
}
