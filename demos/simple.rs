//! Loads an executable image privately, as a minimal smoke test of the
//! mapping and relocation pipeline on its own (no import table to
//! speak of for a trivial binary like this one).

const PATH: &str = "C:\\Temp\\Malloc.exe";

fn main() {
    env_logger::init();

    privldr::init().expect("couldn't initialize the private loader");

    let base = privldr::load(std::path::Path::new(PATH)).expect("couldn't load image");
    println!("loaded at {base:p}");

    privldr::shutdown();
    println!("done");
}
