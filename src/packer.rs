//! Word framing for the byte-oriented SPI controller
//!
//! Words of any nibble-aligned width are flattened into a nibble stream,
//! most significant nibble first, and the stream is paired up into bytes.

/// Largest byte count handed to the controller in one transfer.
pub const MAX_CHUNK_BYTES: usize = 64;

/// Nibbles of `word`, most significant first, for a `word_size`-bit word.
fn nibbles(word: u32, word_size: u8) -> impl Iterator<Item = u8> {
    let count = u32::from(word_size / 4);
    (0..count)
        .rev()
        .map(move |i| ((u64::from(word) >> (i * 4)) & 0xf) as u8)
}

/// Pack `words` into bytes, two nibbles per byte.
///
/// `word_size` is expected to be a multiple of 4. When the total nibble
/// count is odd, the trailing nibble is dropped.
pub fn pack_words(words: &[u32], word_size: u8) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * usize::from(word_size) / 8);
    let mut high: Option<u8> = None;

    for nibble in words.iter().flat_map(|w| nibbles(*w, word_size)) {
        match high.take() {
            None => high = Some(nibble << 4),
            Some(h) => bytes.push(h | nibble),
        }
    }

    bytes
}

/// Split a byte stream into transfer-sized chunks, in order.
pub fn chunks(bytes: &[u8]) -> std::slice::Chunks<'_, u8> {
    bytes.chunks(MAX_CHUNK_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_words_pack_to_low_byte() {
        let words = [0x00, 0x7f, 0x1ff, 0xdead_beef];
        assert_eq!(pack_words(&words, 8), vec![0x00, 0x7f, 0xff, 0xef]);
    }

    #[test]
    fn test_nibble_words_pair_up() {
        assert_eq!(pack_words(&[0xA, 0xB, 0xC, 0xD], 4), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_odd_nibble_count_drops_trailing_nibble() {
        assert!(pack_words(&[0xA], 4).is_empty());
        assert_eq!(pack_words(&[0xA, 0xB, 0xC], 4), vec![0xAB]);
    }

    #[test]
    fn test_twelve_bit_words_span_bytes() {
        // 0xABC, 0x123 -> nibbles A B C 1 2 3
        assert_eq!(pack_words(&[0xABC, 0x123], 12), vec![0xAB, 0xC1, 0x23]);
    }

    #[test]
    fn test_wide_words() {
        assert_eq!(
            pack_words(&[0x0102_0304], 32),
            vec![0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn test_chunk_boundaries() {
        for len in [0usize, 1, 63, 64, 65, 128, 130] {
            let bytes: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let parts: Vec<&[u8]> = chunks(&bytes).collect();

            assert_eq!(parts.len(), (len + MAX_CHUNK_BYTES - 1) / MAX_CHUNK_BYTES);
            if let Some((last, rest)) = parts.split_last() {
                assert!(rest.iter().all(|c| c.len() == MAX_CHUNK_BYTES));
                let expected_last = if len % MAX_CHUNK_BYTES == 0 {
                    MAX_CHUNK_BYTES
                } else {
                    len % MAX_CHUNK_BYTES
                };
                assert_eq!(last.len(), expected_last);
            }
            assert_eq!(parts.concat(), bytes);
        }
    }
}
