use rand::Rng;
use time::{OffsetDateTime, UtcOffset};

const MAX_ATTEMPTS: usize = 128;
const SUFFIX_SPACE: u32 = 36 * 36 * 36;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `<prefix>-YYYYMMDD-HHMMSS-<3 base36 chars>`, retried until `exists`
/// rejects the candidate. Falls back to a nanosecond suffix.
pub fn generate_stamped_id<F>(prefix: &str, now: OffsetDateTime, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    let stamp = stamp(prefix, now);
    let mut rng = rand::rng();
    for _ in 0..MAX_ATTEMPTS {
        let candidate = format!("{stamp}-{}", base36(rng.random_range(0..SUFFIX_SPACE)));
        if !exists(&candidate) {
            return candidate;
        }
    }
    format!("{stamp}-{}", now.unix_timestamp_nanos())
}

/// `lock-<unix seconds>-<6 random digits>`.
pub fn lock_token(now: OffsetDateTime) -> String {
    let suffix = rand::rng().random_range(0..1_000_000u32);
    format!("lock-{}-{suffix:06}", now.unix_timestamp())
}

fn stamp(prefix: &str, now: OffsetDateTime) -> String {
    let now = now.to_offset(UtcOffset::UTC);
    format!(
        "{prefix}-{:04}{:02}{:02}-{:02}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn base36(mut value: u32) -> String {
    let mut out = [b'0'; 3];
    for slot in out.iter_mut().rev() {
        *slot = BASE36[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}
