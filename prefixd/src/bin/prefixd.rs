use prefixd_kubernetes::controller::error::Error;

fn main() -> Result<(), Error> {
    prefixd_cmd::cmd::run()
}
