//! Multipart part-size planning.
//!
//! The remote service bounds the part size from both sides and caps the
//! number of parts. Within those limits we prefer the smallest workable
//! part, since every in-flight part is held in memory, but never go below
//! a baseline that keeps large files from turning into thousands of tiny
//! requests.

use crate::error::SyncError;
use crate::store::UploadParameters;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Preferred part sizes are multiples of this.
pub const BASELINE_PART_SIZE: u64 = 16 * MIB;

/// Number of parts needed to cover `file_size` bytes.
pub fn part_count(file_size: u64, part_size: u64) -> u64 {
    file_size.div_ceil(part_size)
}

/// Whether `part_size` satisfies every limit for a file of `file_size` bytes.
pub fn is_valid_part_size(params: &UploadParameters, file_size: u64, part_size: u64) -> bool {
    part_size >= params.min_part_size
        && part_size <= params.max_part_size
        && part_size > 0
        && part_count(file_size, part_size) <= params.max_num_parts
}

/// Compute the part size for uploading a file of `file_size` bytes.
///
/// Starts from the minimum part size rounded up to the baseline and
/// doubles until the part count fits. When doubling overshoots, the
/// maximum part size is used; the up-front check guarantees it fits.
pub fn plan_part_size(params: &UploadParameters, file_size: u64) -> Result<u64, SyncError> {
    if params.max_part_size == 0 || params.min_part_size > params.max_part_size {
        return Err(SyncError::Validation {
            file_size,
            reason: format!(
                "invalid part size range [{}, {}]",
                params.min_part_size, params.max_part_size
            ),
        });
    }
    if file_size > params.max_file_size {
        return Err(SyncError::Validation {
            file_size,
            reason: format!("the limit is {} bytes", params.max_file_size),
        });
    }

    let min_num_parts = part_count(file_size, params.max_part_size);
    if min_num_parts > params.max_num_parts {
        return Err(SyncError::Validation {
            file_size,
            reason: format!(
                "at least {} parts are needed but the limit is {}",
                min_num_parts, params.max_num_parts
            ),
        });
    }

    let mut preferred = params
        .min_part_size
        .div_ceil(BASELINE_PART_SIZE)
        .saturating_mul(BASELINE_PART_SIZE)
        .max(BASELINE_PART_SIZE);
    while preferred < params.max_part_size {
        if is_valid_part_size(params, file_size, preferred) {
            return Ok(preferred);
        }
        preferred = preferred.saturating_mul(2);
    }

    Ok(params.max_part_size)
}
