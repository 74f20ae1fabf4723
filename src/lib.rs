#[cfg(target_os = "linux")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[macro_use]
extern crate cfg_if;
#[macro_use]
extern crate log;

pub mod config;
pub mod ds_impl;

cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub struct MemSampler {
            epoch_mib: tikv_jemalloc_ctl::epoch_mib,
            allocated_mib: tikv_jemalloc_ctl::stats::allocated_mib,
        }

        impl MemSampler {
            pub fn new() -> anyhow::Result<Self> {
                Ok(MemSampler {
                    epoch_mib: tikv_jemalloc_ctl::epoch::mib()
                        .map_err(|e| anyhow::anyhow!("jemalloc epoch mib lookup failed: {}", e))?,
                    allocated_mib: tikv_jemalloc_ctl::stats::allocated::mib()
                        .map_err(|e| anyhow::anyhow!("jemalloc allocated mib lookup failed: {}", e))?,
                })
            }

            /// Bytes currently allocated through jemalloc, or 0 if the stats could not be read.
            pub fn sample(&self) -> usize {
                if self.epoch_mib.advance().is_err() {
                    return 0;
                }
                self.allocated_mib.read().unwrap_or(0)
            }
        }
    } else {
        pub struct MemSampler {}

        impl MemSampler {
            pub fn new() -> anyhow::Result<Self> {
                warn!("Memory usage benchmark is supported only for linux.");
                Ok(MemSampler {})
            }

            pub fn sample(&self) -> usize {
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemSampler;

    #[cfg(target_os = "linux")]
    #[test]
    fn sampler_reads_allocated_bytes() {
        let sampler = MemSampler::new().unwrap();
        let held = vec![0u8; 1 << 20];
        assert!(sampler.sample() >= held.len());
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn sampler_is_a_no_op() {
        assert_eq!(MemSampler::new().unwrap().sample(), 0);
    }
}
