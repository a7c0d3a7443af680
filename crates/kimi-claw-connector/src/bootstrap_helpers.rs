use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub(crate) fn default_log_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

pub(crate) fn init_tracing(verbose: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_log_level(verbose).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::default_log_level;

    #[test]
    fn unit_verbose_flag_raises_default_level_to_debug() {
        assert_eq!(default_log_level(false), LevelFilter::INFO);
        assert_eq!(default_log_level(true), LevelFilter::DEBUG);
    }
}
