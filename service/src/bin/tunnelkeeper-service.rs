fn main() {
    let exit = tunnelkeeper_service::bootstrap::run(std::env::args_os().skip(1).collect());

    std::process::exit(exit.code());
}
