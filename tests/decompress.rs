mod common;

use common::*;
use fast_lzma2::{
    decompress, decompress_mt, estimate_decoder_size, estimate_stream_size,
    find_decompressed_size, Decoder, Error,
};

#[test]
fn empty_payload_hashed() {
    // Property byte with the hash flag, the end marker, then XXH32("").
    assert_eq!(digest_be(b""), [0x02, 0xCC, 0x5D, 0x05]);
    let stream = [0x41, 0x00, 0x02, 0xCC, 0x5D, 0x05];
    let mut dst = [0u8; 0];
    assert_eq!(decompress(&mut dst, &stream), Ok(0));
    assert_eq!(decompress_mt(&mut dst, &stream, 2), Ok(0));
}

#[test]
fn single_uncompressed_chunk() {
    let stream = [
        0x01, 0x01, 0x00, 0x0A, b'H', b'e', b'l', b'l', b'o', b',', b'W', b'o', b'r', b'l', b'd',
        0x00,
    ];
    let mut dst = [0u8; 32];
    let size = decompress(&mut dst, &stream).unwrap();
    assert_eq!(&dst[..size], b"Hello,World");
}

#[test]
fn final_marker_only() {
    let mut dst = [0u8; 4];
    assert_eq!(decompress(&mut dst, &[0x00, 0x00]), Ok(0));
    assert_eq!(decompress_mt(&mut dst, &[0x00, 0x00], 4), Ok(0));
}

#[test]
fn uncompressed_blocks_match_across_thread_counts() {
    let a = test_data(200_000, 1);
    let b = test_data(70_000, 2);
    let c = test_data(131_072, 3);
    let blocks: Vec<&[u8]> = vec![&a, &b, &c];
    let stream = uncompressed_stream(&blocks, 0x00);
    let plain: Vec<u8> = blocks.concat();

    let mut reference = vec![0u8; plain.len()];
    let size = decompress(&mut reference, &stream).unwrap();
    assert_eq!(size, plain.len());
    assert!(reference == plain);

    for nb_threads in 2..=8 {
        let mut dst = vec![0u8; plain.len()];
        let size = decompress_mt(&mut dst, &stream, nb_threads).unwrap();
        assert_eq!(size, plain.len());
        assert!(dst == reference);
    }
}

#[test]
fn literal_chunks_round_trip() {
    let plain = test_data(50_000, 7);
    let stream = literal_stream(&[&plain], 0x08);
    let mut dst = vec![0u8; plain.len()];
    let size = decompress(&mut dst, &stream).unwrap();
    assert_eq!(size, plain.len());
    assert!(dst == plain);
}

#[test]
fn literal_blocks_parallel_match_single() {
    let a = test_data(60_000, 11);
    let b = test_data(45_000, 12);
    let c = test_data(90_000, 13);
    let d = test_data(10, 14);
    let blocks: Vec<&[u8]> = vec![&a, &b, &c, &d];
    let stream = literal_stream(&blocks, 0x0A);
    let plain: Vec<u8> = blocks.concat();

    let mut reference = vec![0u8; plain.len()];
    decompress(&mut reference, &stream).unwrap();
    assert!(reference == plain);

    for nb_threads in [2, 3, 8] {
        let mut dst = vec![0u8; plain.len()];
        let size = decompress_mt(&mut dst, &stream, nb_threads).unwrap();
        assert_eq!(size, plain.len());
        assert!(dst == reference);
    }
}

#[test]
fn mixed_chunk_kinds_in_one_block() {
    // Uncompressed resets the dictionary, then literal chunks follow with a
    // props reset, a plain continuation and a state reset.
    let u = test_data(1_000, 21);
    let l1 = test_data(2_000, 22);
    let l2 = test_data(1_500, 23);
    let l3 = test_data(500, 24);

    let mut stream = vec![0x00];
    let mut enc = LiteralChunkEncoder::new();
    push_uncompressed(&mut stream, &u, true);
    push_literal_chunk(&mut stream, &mut enc, &l1, 0xC0);
    push_literal_chunk(&mut stream, &mut enc, &l2, 0x80);
    push_literal_chunk(&mut stream, &mut enc, &l3, 0xA0);
    stream.push(0x00);

    let plain: Vec<u8> = [u, l1, l2, l3].concat();
    let mut dst = vec![0u8; plain.len()];
    let size = decompress(&mut dst, &stream).unwrap();
    assert_eq!(size, plain.len());
    assert!(dst == plain);

    let mut dst_mt = vec![0u8; plain.len()];
    assert_eq!(decompress_mt(&mut dst_mt, &stream, 2), Ok(plain.len()));
    assert!(dst_mt == plain);
}

#[test]
fn hashed_stream_verifies() {
    let plain = test_data(30_000, 31);
    let stream = literal_stream(&[&plain], 0x04 | PROP_HASH_FLAG);
    let mut dst = vec![0u8; plain.len()];
    assert_eq!(decompress(&mut dst, &stream), Ok(plain.len()));
    assert!(dst == plain);
    assert_eq!(decompress_mt(&mut dst, &stream, 4), Ok(plain.len()));
}

#[test]
fn flipped_digest_bit_is_checksum_error() {
    let plain = test_data(5_000, 41);
    let mut stream = uncompressed_stream(&[&plain], PROP_HASH_FLAG);
    let last = stream.len() - 1;
    stream[last] ^= 0x01;
    let mut dst = vec![0u8; plain.len()];
    assert_eq!(decompress(&mut dst, &stream), Err(Error::ChecksumWrong));
    assert_eq!(
        decompress_mt(&mut dst, &stream, 2),
        Err(Error::ChecksumWrong)
    );
}

#[test]
fn flipped_payload_bit_is_caught() {
    let plain = test_data(5_000, 42);

    // In an uncompressed chunk the flip reaches the output verbatim, so the
    // digest is what catches it.
    let mut stream = uncompressed_stream(&[&plain], PROP_HASH_FLAG);
    stream[100] ^= 0x10;
    let mut dst = vec![0u8; plain.len()];
    assert_eq!(decompress(&mut dst, &stream), Err(Error::ChecksumWrong));

    // In a range-coded chunk the flip either derails decoding or corrupts
    // the output.
    let mut stream = literal_stream(&[&plain], PROP_HASH_FLAG);
    stream[200] ^= 0x10;
    let mut dst = vec![0u8; plain.len()];
    let err = decompress(&mut dst, &stream).unwrap_err();
    assert!(matches!(
        err,
        Error::ChecksumWrong | Error::CorruptionDetected | Error::SrcSizeWrong
    ));
}

#[test]
fn truncated_at_chunk_header() {
    let plain = test_data(1_000, 51);
    let stream = uncompressed_stream(&[&plain], 0x00);
    // Cut inside the second size byte of the chunk header.
    let cut = &stream[..3];
    let mut dst = vec![0u8; plain.len()];
    assert_eq!(decompress(&mut dst, cut), Err(Error::SrcSizeWrong));
    assert_eq!(decompress_mt(&mut dst, cut, 2), Err(Error::SrcSizeWrong));
}

#[test]
fn truncated_in_payload() {
    let plain = test_data(1_000, 52);
    let stream = uncompressed_stream(&[&plain], 0x00);
    let cut = &stream[..stream.len() / 2];
    let mut dst = vec![0u8; plain.len()];
    assert_eq!(decompress(&mut dst, cut), Err(Error::SrcSizeWrong));
    assert_eq!(decompress_mt(&mut dst, cut, 3), Err(Error::SrcSizeWrong));
}

#[test]
fn missing_end_marker() {
    let plain = test_data(1_000, 53);
    let stream = uncompressed_stream(&[&plain], 0x00);
    let cut = &stream[..stream.len() - 1];
    let mut dst = vec![0u8; plain.len()];
    assert_eq!(decompress(&mut dst, cut), Err(Error::SrcSizeWrong));
    assert_eq!(decompress_mt(&mut dst, cut, 2), Err(Error::SrcSizeWrong));
}

#[test]
fn property_byte_out_of_range() {
    let stream = [45, 0x00];
    let mut dst = [0u8; 4];
    assert_eq!(decompress(&mut dst, &stream), Err(Error::CorruptionDetected));
    assert_eq!(
        decompress_mt(&mut dst, &stream, 2),
        Err(Error::CorruptionDetected)
    );
}

#[test]
fn reserved_control_byte() {
    let stream = [0x00, 0x7F, 0x00, 0x00];
    let mut dst = [0u8; 4];
    assert_eq!(decompress(&mut dst, &stream), Err(Error::CorruptionDetected));
    assert_eq!(
        decompress_mt(&mut dst, &stream, 2),
        Err(Error::CorruptionDetected)
    );
}

#[test]
fn first_chunk_must_reset_dictionary() {
    let stream = [0x00, 0x02, 0x00, 0x00, b'x', 0x00];
    let mut dst = [0u8; 4];
    assert_eq!(decompress(&mut dst, &stream), Err(Error::CorruptionDetected));
}

#[test]
fn destination_too_small() {
    let plain = test_data(2_000, 61);
    let stream = uncompressed_stream(&[&plain], 0x00);
    let mut dst = vec![0u8; plain.len() - 1];
    assert_eq!(decompress(&mut dst, &stream), Err(Error::DstSizeTooSmall));
    assert_eq!(
        decompress_mt(&mut dst, &stream, 2),
        Err(Error::DstSizeTooSmall)
    );
}

#[test]
fn empty_source() {
    let mut dst = [0u8; 4];
    assert_eq!(decompress(&mut dst, &[]), Err(Error::SrcSizeWrong));
}

#[test]
fn out_of_band_property_byte() {
    let plain = test_data(3_000, 71);
    let stream = uncompressed_stream(&[&plain], 0x00);
    let chunks = &stream[1..];

    let mut decoder = Decoder::new(2);
    decoder.set_prop(0x00).unwrap();
    let mut dst = vec![0u8; plain.len()];
    assert_eq!(decoder.decompress(&mut dst, chunks), Ok(plain.len()));
    assert!(dst == plain);

    // The property byte applies once; the next call reads it from the input.
    assert_eq!(decoder.decompress(&mut dst, &stream), Ok(plain.len()));
    assert!(dst == plain);
}

#[test]
fn out_of_band_property_byte_rejected() {
    let mut decoder = Decoder::new(1);
    assert_eq!(decoder.set_prop(45), Err(Error::CorruptionDetected));
    assert_eq!(decoder.set_prop(45 | PROP_HASH_FLAG), Err(Error::CorruptionDetected));
    decoder.set_prop(40).unwrap();
}

#[test]
fn decompressed_size_oracle() {
    let a = test_data(70_000, 81);
    let b = test_data(1_234, 82);
    let stream = uncompressed_stream(&[&a, &b], 0x00);
    assert_eq!(find_decompressed_size(&stream), Ok(Some(71_234)));

    let lzma = literal_stream(&[&a], 0x00);
    assert_eq!(find_decompressed_size(&lzma), Ok(Some(70_000)));

    assert_eq!(find_decompressed_size(&stream[..4]), Ok(None));
    assert_eq!(find_decompressed_size(&[]), Ok(None));
    assert_eq!(
        find_decompressed_size(&[0x00, 0x55]),
        Err(Error::CorruptionDetected)
    );
}

#[test]
fn size_estimates_scale_with_threads() {
    assert!(estimate_decoder_size(4) >= 4 * estimate_decoder_size(1) / 2);
    let st = estimate_stream_size(1 << 20, 1);
    let mt = estimate_stream_size(1 << 20, 4);
    assert!(st >= 1 << 20);
    assert!(mt > st);
}
