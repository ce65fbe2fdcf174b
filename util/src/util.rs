use std::io::Write;

/// Max grpc message size in bytes.
pub const MESSAGE_LIMIT: usize = 20 * 1024 * 1024;

/// Bits used for column id in namespaced feature id.
pub const COLUMN_BITS: u32 = 16;

/// Init log. Set log format.
pub fn init_log() {
    env_logger::builder()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}:{} - {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();
}

/// Log the error message, then bail.
#[macro_export]
macro_rules! error_bail {
    ($msg:literal $(,)?) => {
        error!($msg);
        bail!($msg)
    };
    ($err:expr $(,)?) => {
        error!("{}", $err);
        bail!($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        error!($fmt, $($arg)*);
        bail!($fmt, $($arg)*)
    };
}

/// Mix seed and key into a new well distributed `u64`, splitmix64 finalizer.
///
/// Used to derive a per-key random seed, so the result is independent of the order keys are visited.
#[inline]
pub fn mix_seed(seed: u64, key: u64) -> u64 {
    let mut z = seed ^ key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Put column id into the high `COLUMN_BITS` bits of the raw id.
///
/// Different feature columns sharing one table may have the same raw id, the column id is used
/// to avoid collision. The high bits of raw id are dropped.
#[inline]
pub fn namespaced_feature_id(column: u16, raw: u64) -> u64 {
    let shift = u64::BITS - COLUMN_BITS;
    ((column as u64) << shift) | (raw & ((1u64 << shift) - 1))
}

/// Parse comma separated endpoints, empty items are ignored.
pub fn split_endpoints(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_string())
        .collect()
}
