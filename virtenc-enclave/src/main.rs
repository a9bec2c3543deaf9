fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();

    match virtenc_enclave::run() {
        Ok(status) => std::process::exit(status),
        Err(err) => {
            log::error!("Enclave runtime failed: {:#}", err);
            std::process::exit(1);
        }
    }
}
