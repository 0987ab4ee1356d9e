fn main() {
    // Default worker count baked in so `-j` can fall back to it without
    // re-querying the OS at every `--help`.
    const MIN_THREADS: usize = 1;
    let num_threads =
        std::thread::available_parallelism().map_or(MIN_THREADS, core::num::NonZeroUsize::get);

    println!("cargo:rustc-env=THREAD_COUNT={num_threads}");
}
