use eyre::Result;
use leakpath::LeakTrackingAllocator;

#[global_allocator]
static GLOBAL: LeakTrackingAllocator = LeakTrackingAllocator;

#[inline(never)]
fn cache_entry(key: u32) {
    let entry = Box::new((key, [0u8; 24]));
    std::mem::forget(entry);
}

#[leakpath::main(format = "table", aggregate = true, max_data_dump = 16)]
fn main() -> Result<()> {
    for key in 0..3 {
        cache_entry(key);
    }
    Ok(())
}
