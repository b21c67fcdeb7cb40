fn main() {
    let args = std::env::args();

    if let Err(err) = unionfs::run(args) {
        eprintln!("unionfs error: {err}");
        std::process::exit(1);
    }
}
