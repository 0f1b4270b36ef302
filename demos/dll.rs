//! Loads a DLL privately and lets its own `DllMain` run, without ever
//! registering the module with the process's loader.

const PATH: &str = "C:\\Temp\\call.dll";

fn main() {
    env_logger::init();

    privldr::init().expect("couldn't initialize the private loader");

    let base = privldr::load(std::path::Path::new(PATH)).expect("couldn't load DLL");
    println!("loaded at {base:p}");

    privldr::unload(base);
    privldr::shutdown();
    println!("done");
}
