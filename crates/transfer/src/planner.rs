//! Part size selection.
//!
//! A vault accepts at most [`MAX_PARTS`] parts per upload, and every part
//! size must be a power-of-two number of MiB between 1 MiB and 4 GiB. The
//! planner doubles a baseline size until the archive fits in
//! [`TARGET_MAX_PARTS`] parts, which leaves headroom below the hard limit.

use vaultpush_protocol::{ByteRange, GIB, MAX_PARTS, MIB};

/// Smallest part size the service accepts.
pub const MIN_PART_SIZE: u64 = MIB;

/// Largest part size the service accepts.
pub const MAX_PART_SIZE: u64 = 4 * GIB;

/// Largest part size the planner will pick on its own.
pub const PLANNED_PART_SIZE_LIMIT: u64 = 3 * GIB;

/// Part count the planner aims to stay at or below.
pub const TARGET_MAX_PARTS: u64 = 9_000;

/// Starting candidate for automatic planning.
pub const DEFAULT_BASELINE_PART_SIZE: u64 = 4 * MIB;

/// Configuration errors detected before any transfer begins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error(
        "invalid part size {0}: must be a power-of-two number of MiB between 1 MiB and 4 GiB"
    )]
    InvalidPartSize(u64),

    #[error("archive of {archive_size} bytes would need parts larger than {limit} bytes")]
    PartSizeExceeded { archive_size: u64, limit: u64 },

    #[error("part size {part_size} splits {archive_size} bytes into {parts} parts (limit {limit})")]
    TooManyParts {
        archive_size: u64,
        part_size: u64,
        parts: u64,
        limit: u64,
    },

    #[error("archive is empty")]
    EmptyArchive,
}

/// Checks that `size` is a power-of-two number of MiB within service limits.
pub fn validate_part_size(size: u64) -> Result<(), PlanError> {
    let valid = (MIN_PART_SIZE..=MAX_PART_SIZE).contains(&size)
        && size % MIB == 0
        && (size / MIB).is_power_of_two();
    if valid {
        Ok(())
    } else {
        Err(PlanError::InvalidPartSize(size))
    }
}

/// Number of parts needed to cover `archive_size` bytes.
///
/// `part_size` must be non-zero.
pub fn part_count(archive_size: u64, part_size: u64) -> u64 {
    archive_size.div_ceil(part_size)
}

/// Picks a part size for `archive_size` using the default baseline.
pub fn choose_part_size(archive_size: u64) -> Result<u64, PlanError> {
    PartPlanner::default().choose_part_size(archive_size)
}

/// Stateless part size planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlanner {
    baseline: u64,
}

impl Default for PartPlanner {
    fn default() -> Self {
        Self {
            baseline: DEFAULT_BASELINE_PART_SIZE,
        }
    }
}

impl PartPlanner {
    /// Creates a planner that starts from `baseline` bytes per part.
    pub fn new(baseline: u64) -> Result<Self, PlanError> {
        validate_part_size(baseline)?;
        Ok(Self { baseline })
    }

    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Doubles the baseline until the archive fits in [`TARGET_MAX_PARTS`].
    pub fn choose_part_size(&self, archive_size: u64) -> Result<u64, PlanError> {
        let exceeded = PlanError::PartSizeExceeded {
            archive_size,
            limit: PLANNED_PART_SIZE_LIMIT,
        };

        let mut part_size = self.baseline;
        while part_count(archive_size, part_size) > TARGET_MAX_PARTS {
            part_size *= 2;
            if part_size > PLANNED_PART_SIZE_LIMIT {
                return Err(exceeded);
            }
        }
        if part_size > PLANNED_PART_SIZE_LIMIT {
            return Err(exceeded);
        }
        Ok(part_size)
    }

    /// Builds the part layout for an archive.
    ///
    /// A caller-supplied `override_size` is validated, never adjusted.
    pub fn plan(&self, archive_size: u64, override_size: Option<u64>) -> Result<PartPlan, PlanError> {
        if archive_size == 0 {
            return Err(PlanError::EmptyArchive);
        }
        let part_size = match override_size {
            Some(size) => {
                validate_part_size(size)?;
                size
            }
            None => self.choose_part_size(archive_size)?,
        };
        PartPlan::new(archive_size, part_size)
    }
}

/// The part layout of one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    archive_size: u64,
    part_size: u64,
    total_parts: u64,
}

impl PartPlan {
    /// Validates `part_size` against `archive_size` and the part-count limit.
    pub fn new(archive_size: u64, part_size: u64) -> Result<Self, PlanError> {
        if archive_size == 0 {
            return Err(PlanError::EmptyArchive);
        }
        validate_part_size(part_size)?;
        let total_parts = part_count(archive_size, part_size);
        if total_parts > MAX_PARTS {
            return Err(PlanError::TooManyParts {
                archive_size,
                part_size,
                parts: total_parts,
                limit: MAX_PARTS,
            });
        }
        Ok(Self {
            archive_size,
            part_size,
            total_parts,
        })
    }

    pub fn archive_size(&self) -> u64 {
        self.archive_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn total_parts(&self) -> u64 {
        self.total_parts
    }

    /// Length of the final part; equals `part_size` when evenly divisible.
    pub fn last_part_size(&self) -> u64 {
        self.archive_size - self.part_size * (self.total_parts - 1)
    }

    /// Byte range of a 1-based part number.
    pub fn part_range(&self, part_number: u64) -> Option<ByteRange> {
        if part_number == 0 || part_number > self.total_parts {
            return None;
        }
        let start = (part_number - 1) * self.part_size;
        let length = self.part_size.min(self.archive_size - start);
        Some(ByteRange::new(start, length))
    }

    /// Iterates over every part range in order.
    pub fn ranges(&self) -> impl Iterator<Item = ByteRange> + '_ {
        (1..=self.total_parts).filter_map(|n| self.part_range(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_powers_of_two_mib() {
        for mib in [1u64, 2, 4, 8, 1024, 4096] {
            assert!(validate_part_size(mib * MIB).is_ok(), "{mib} MiB");
        }
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        for size in [0, MIB / 2, 3 * MIB, MIB + 1, 8 * GIB, 6 * MIB] {
            assert_eq!(
                validate_part_size(size),
                Err(PlanError::InvalidPartSize(size))
            );
        }
    }

    #[test]
    fn small_archive_uses_baseline() {
        assert_eq!(choose_part_size(1).unwrap(), DEFAULT_BASELINE_PART_SIZE);
        assert_eq!(choose_part_size(GIB).unwrap(), DEFAULT_BASELINE_PART_SIZE);
    }

    #[test]
    fn forty_gib_archive_fits_target() {
        let size = 40 * GIB;
        let part_size = choose_part_size(size).unwrap();
        assert!(part_size >= 4 * MIB);
        assert!(part_count(size, part_size) <= TARGET_MAX_PARTS);
        assert_eq!(part_size, 8 * MIB);
    }

    #[test]
    fn boundary_at_target_parts() {
        // Exactly 9000 baseline parts stays at baseline; one more byte doubles.
        let size = TARGET_MAX_PARTS * DEFAULT_BASELINE_PART_SIZE;
        assert_eq!(choose_part_size(size).unwrap(), DEFAULT_BASELINE_PART_SIZE);
        assert_eq!(
            choose_part_size(size + 1).unwrap(),
            2 * DEFAULT_BASELINE_PART_SIZE
        );
    }

    #[test]
    fn planned_sizes_are_valid_across_range() {
        let planner = PartPlanner::new(MIB).unwrap();
        let mut size = 1u64;
        while size < TARGET_MAX_PARTS * 2 * GIB {
            let part_size = planner.choose_part_size(size).unwrap();
            validate_part_size(part_size).unwrap();
            assert!(part_count(size, part_size) <= TARGET_MAX_PARTS);
            size = size * 3 + 7;
        }
    }

    #[test]
    fn huge_archive_exceeds_limit() {
        // 2 GiB parts hold 18000 GiB in 9000 parts; anything larger needs 4 GiB.
        let size = TARGET_MAX_PARTS * 2 * GIB + 1;
        assert_eq!(
            choose_part_size(size),
            Err(PlanError::PartSizeExceeded {
                archive_size: size,
                limit: PLANNED_PART_SIZE_LIMIT
            })
        );
        assert_eq!(choose_part_size(size - 1).unwrap(), 2 * GIB);
    }

    #[test]
    fn planner_is_deterministic() {
        let planner = PartPlanner::default();
        let size = 123_456_789_012;
        assert_eq!(
            planner.choose_part_size(size).unwrap(),
            planner.choose_part_size(size).unwrap()
        );
    }

    #[test]
    fn planner_rejects_invalid_baseline() {
        assert_eq!(
            PartPlanner::new(3 * MIB),
            Err(PlanError::InvalidPartSize(3 * MIB))
        );
    }

    #[test]
    fn plan_rejects_invalid_override() {
        let planner = PartPlanner::default();
        assert_eq!(
            planner.plan(100, Some(5 * MIB)),
            Err(PlanError::InvalidPartSize(5 * MIB))
        );
    }

    #[test]
    fn plan_rejects_override_with_too_many_parts() {
        let planner = PartPlanner::default();
        let size = MAX_PARTS * MIB + 1;
        assert!(matches!(
            planner.plan(size, Some(MIB)),
            Err(PlanError::TooManyParts { parts, .. }) if parts == MAX_PARTS + 1
        ));
    }

    #[test]
    fn plan_rejects_empty_archive() {
        assert_eq!(
            PartPlanner::default().plan(0, None),
            Err(PlanError::EmptyArchive)
        );
    }

    #[test]
    fn ranges_cover_archive_exactly() {
        for (size, part_size) in [
            (1, MIB),
            (MIB, MIB),
            (MIB + 1, MIB),
            (10 * MIB, 4 * MIB),
            (12 * MIB, 4 * MIB),
        ] {
            let plan = PartPlan::new(size, part_size).unwrap();
            let mut expected_start = 0;
            for range in plan.ranges() {
                assert_eq!(range.start, expected_start);
                assert!(range.length > 0 && range.length <= part_size);
                expected_start = range.end();
            }
            assert_eq!(expected_start, size);
            assert_eq!(plan.ranges().count() as u64, plan.total_parts());

            let remainder = size % part_size;
            let expected_last = if remainder == 0 { part_size } else { remainder };
            assert_eq!(plan.last_part_size(), expected_last);
        }
    }

    #[test]
    fn part_range_out_of_bounds() {
        let plan = PartPlan::new(10 * MIB, 4 * MIB).unwrap();
        assert_eq!(plan.total_parts(), 3);
        assert!(plan.part_range(0).is_none());
        assert!(plan.part_range(4).is_none());
        assert_eq!(plan.part_range(3), Some(ByteRange::new(8 * MIB, 2 * MIB)));
    }
}
