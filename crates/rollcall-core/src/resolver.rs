use crate::capability::{DetectionError, Encoder, Matcher};
use crate::types::{Identity, KnownFace};

/// Turns a live frame into at most one roster identity.
///
/// Stateless. When several faces match, the first in encoder order wins;
/// that order comes from the external detector and is not guaranteed to be
/// stable between frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        Self
    }

    /// Encode every face in `frame` and return the first accepted match.
    ///
    /// `Ok(None)` covers no face, no embedding, an empty roster and no match
    /// under the matcher's threshold. Encoder failures are returned as-is.
    pub fn resolve<E, M>(
        &self,
        frame: &E::Frame,
        known: &[KnownFace],
        encoder: &mut E,
        matcher: &M,
    ) -> Result<Option<Identity>, DetectionError>
    where
        E: Encoder + ?Sized,
        M: Matcher + ?Sized,
    {
        if known.is_empty() {
            return Ok(None);
        }

        let embeddings = encoder.encode(frame)?;
        for (face_idx, embedding) in embeddings.iter().enumerate() {
            let Some(candidate) = matcher.nearest(embedding, known) else {
                continue;
            };
            tracing::trace!(
                face = face_idx,
                nearest = candidate.index,
                distance = candidate.distance,
                is_match = candidate.is_match,
                "resolver: nearest roster entry"
            );
            if !candidate.is_match {
                continue;
            }
            let Some(face) = known.get(candidate.index) else {
                tracing::warn!(index = candidate.index, "matcher returned out-of-range index");
                continue;
            };
            return Ok(Some(Identity {
                id: face.id.clone(),
                distance: candidate.distance,
            }));
        }

        Ok(None)
    }
}
