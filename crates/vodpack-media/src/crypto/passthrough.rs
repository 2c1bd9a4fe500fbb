//! CENC passthrough: forward protected source samples as stored.
//!
//! When every part of a sequence was encrypted with the output key and
//! carries auxiliary information of one shape, decrypting and encrypting
//! again would reproduce the stored bytes. The frames are then read
//! without decryption and the stored sample records are copied into the
//! fragment.

use tracing::debug;

use super::cenc::SampleAux;
use crate::layout::Layout;
use crate::media::{Sequence, CENC_IV_SIZE};
use crate::mp4::boxes::AuxBoxes;

/// Stored auxiliary information of a sequence that qualifies for
/// passthrough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passthrough {
    aux: SampleAux,
}

impl Passthrough {
    /// Check whether `sequence` can skip decrypt-then-encrypt. Any mismatch
    /// returns `None`.
    pub fn detect(sequence: &Sequence) -> Option<Self> {
        let drm = sequence.drm.as_ref()?;
        let first = sequence.clips.iter().flat_map(|c| &c.parts).next()?.protection.as_ref()?;
        let default_size = first.default_aux_size;
        let use_subsamples = first.use_subsamples;

        let mut sizes = Vec::with_capacity(sequence.total_frame_count());
        let mut data = Vec::new();
        for part in sequence.clips.iter().flat_map(|c| &c.parts) {
            let Some(protection) = &part.protection else {
                debug!(sequence = sequence.index, "passthrough: clear part");
                return None;
            };
            if protection.key != drm.key {
                debug!(sequence = sequence.index, "passthrough: key mismatch");
                return None;
            }
            if protection.default_aux_size != default_size
                || protection.use_subsamples != use_subsamples
                || usize::from(protection.iv_size) != CENC_IV_SIZE
            {
                debug!(sequence = sequence.index, "passthrough: auxiliary info shape mismatch");
                return None;
            }

            if default_size == 0 {
                if protection.aux_sizes.len() != part.frames.len() {
                    return None;
                }
                sizes.extend_from_slice(&protection.aux_sizes);
            } else {
                sizes.extend(std::iter::repeat(default_size).take(part.frames.len()));
            }
            data.extend_from_slice(&protection.aux_info);
        }

        let expected: usize = sizes.iter().map(|&s| usize::from(s)).sum();
        if expected != data.len() {
            debug!(
                sequence = sequence.index,
                expected,
                actual = data.len(),
                "passthrough: auxiliary info size mismatch"
            );
            return None;
        }

        Some(Self {
            aux: SampleAux {
                use_subsamples,
                default_size,
                sample_count: sizes.len() as u32,
                sizes,
                data: data.into(),
            },
        })
    }

    pub fn aux(&self) -> &SampleAux {
        &self.aux
    }

    /// saiz, saio and senc for the fragment.
    pub fn boxes(&self) -> AuxBoxes {
        self.aux.clone().into_boxes()
    }

    pub fn saiz_size(&self) -> usize {
        self.boxes().saiz.size()
    }

    pub fn saio_size(&self) -> usize {
        self.boxes().saio.size()
    }

    /// Size of the stored sample records.
    pub fn aux_info_size(&self) -> usize {
        self.aux.data.len()
    }

    /// Bytes the auxiliary boxes add to the traf.
    pub fn total_size(&self) -> usize {
        self.boxes().size()
    }
}
