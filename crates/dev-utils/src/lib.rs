use std::{collections::BTreeSet, path::Path, sync::Once};

use rand::{distributions::Alphanumeric, Rng};

static INIT: Once = Once::new();
static mut GUARD: Option<tracing_chrome::FlushGuard> = None;

pub fn setup_test_log() {
    INIT.call_once(|| {
        color_backtrace::install();
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::{prelude::*, registry::Registry};
        if option_env!("DEBUG").is_some() {
            // suffix should be current date time
            let time_suffix = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
            std::fs::create_dir_all("./log").unwrap();
            let (chrome_layer, _guard) = ChromeLayerBuilder::new()
                .include_args(true)
                .include_locations(true)
                .file(Path::new(
                    format!("./log/trace-{}.json", time_suffix).as_str(),
                ))
                .build();
            // SAFETY: Test, guarded by `INIT`
            unsafe { GUARD = Some(_guard) };
            tracing::subscriber::set_global_default(
                Registry::default()
                    .with(
                        tracing_subscriber::fmt::Layer::default()
                            .with_line_number(true)
                            .with_file(true),
                    )
                    .with(chrome_layer),
            )
            .unwrap();
        }
    });
}

/// `n` distinct random alphanumeric keys, sorted byte-wise.
pub fn random_sorted_keys(rng: &mut impl Rng, n: usize, len: usize) -> Vec<String> {
    let mut set = BTreeSet::new();
    while set.len() < n {
        let key: String = rng
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        set.insert(key);
    }
    set.into_iter().collect()
}

/// Split sorted keys into consecutive chunks of `range_len`, one per range.
pub fn split_into_ranges(keys: &[String], range_len: usize) -> Vec<Vec<String>> {
    keys.chunks(range_len).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn random_keys_are_sorted_and_unique() {
        let mut rng = StdRng::seed_from_u64(7);
        let keys = random_sorted_keys(&mut rng, 100, 6);
        assert_eq!(keys.len(), 100);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        let ranges = split_into_ranges(&keys, 30);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[3].len(), 10);
    }
}
