//! Store naming.

use chrono::Utc;
use conveyor_common::ProductVersion;
use regex::Regex;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hosted store holding released content approved for every product.
pub const SHARED_RELEASES_ID: &str = "shared-releases";
/// Hosted store capturing content imported from external origins.
pub const SHARED_IMPORTS_ID: &str = "shared-imports";
/// Group proxying the outside world, last in every product group.
pub const DEFAULT_PUBLIC_GROUP: &str = "public";

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W+").expect("valid regex"));
static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[|:]+").expect("valid regex"));

/// Make a name usable inside a store id: runs of non-word characters, then runs of
/// `|` and `:`, become a single `-`.
pub fn safe_url_part(name: &str) -> String {
    let cleaned = NON_WORD.replace_all(name, "-");
    SEPARATORS.replace_all(&cleaned, "-").into_owned()
}

/// `product+<product>+<version>`
pub fn product_store_id(product: &ProductVersion) -> String {
    format!(
        "product+{}+{}",
        safe_url_part(&product.product),
        safe_url_part(&product.version)
    )
}

/// `build+<project>+<suffix>`
pub fn build_store_id(project: &str, suffix: u64) -> String {
    format!("build+{}+{}", safe_url_part(project), suffix)
}

/// Hands out strictly increasing, millisecond-based build suffixes.
///
/// Two builds started in the same millisecond still get distinct ids.
#[derive(Debug, Default)]
pub struct BuildIdGenerator {
    last: AtomicU64,
}

impl BuildIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}
