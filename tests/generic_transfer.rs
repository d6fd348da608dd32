//! End-to-end scenarios for the generic (non-DfuSe) transfer engine, driven
//! against the in-process mock transport in `tests/common`.

mod common;

use common::MockTransport;
use dfu_util_rs::quirks::QuirkFlags;
use dfu_util_rs::transfer::{GenericEngine, TransferContext};

#[test]
fn download_splits_into_monotonically_numbered_blocks_and_manifests() {
    let transport = MockTransport::new();
    let mut engine = GenericEngine::new();
    let mut ctx = TransferContext {
        interface: 0,
        block_size: 8,
        quirks: QuirkFlags::empty(),
        progress: None,
    };

    let image = (0u8..40).collect::<Vec<u8>>();
    engine.download(&transport, &mut ctx, &image).unwrap();

    let state = transport.state.borrow();
    assert_eq!(state.downloaded, image);
    // Five 8-byte chunks (block numbers 0..=4) plus the manifestation
    // trigger (a zero-length DNLOAD to block 0) are the last write seen.
    assert_eq!(state.last_block_num, Some(0));
}

#[test]
fn upload_terminates_on_first_short_block_without_an_explicit_length() {
    let data = b"firmware-image-shorter-than-one-block".to_vec();
    let transport = MockTransport::with_upload_data(data.clone());
    let mut engine = GenericEngine::new();
    let mut ctx = TransferContext {
        interface: 0,
        block_size: 4096,
        quirks: QuirkFlags::empty(),
        progress: None,
    };

    let got = engine.upload(&transport, &mut ctx, None).unwrap();
    assert_eq!(got, data);
}

#[test]
fn upload_stops_at_an_explicit_length_even_mid_block() {
    let data = vec![0x5Au8; 1024];
    let transport = MockTransport::with_upload_data(data);
    let mut engine = GenericEngine::new();
    let mut ctx = TransferContext {
        interface: 0,
        block_size: 256,
        quirks: QuirkFlags::empty(),
        progress: None,
    };

    let got = engine.upload(&transport, &mut ctx, Some(300)).unwrap();
    assert_eq!(got.len(), 300);
}

#[test]
fn progress_callback_reports_monotonically_increasing_totals() {
    let transport = MockTransport::new();
    let mut engine = GenericEngine::new();
    let mut seen = Vec::new();
    {
        let mut ctx = TransferContext {
            interface: 0,
            block_size: 16,
            quirks: QuirkFlags::empty(),
            progress: Some(&mut |done, _total| seen.push(done)),
        };
        engine.download(&transport, &mut ctx, &vec![0u8; 64]).unwrap();
    }
    assert_eq!(seen, vec![16, 32, 48, 64]);
}
