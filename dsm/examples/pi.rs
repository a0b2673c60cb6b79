//! Monte-Carlo pi: every process throws darts at the unit square and the
//! hit counts meet in a shared tally. Needs a running session daemon.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ptr;

const NPROC: u32 = 4;
const DARTS: u64 = 200_000;

fn main() {
    let base = dsm::init(dsm::Config::new("pi", NPROC, NPROC, 4096));
    let tally = base as *mut u64;
    let rank = dsm::get_gid() as u64;

    let mut rng = StdRng::seed_from_u64(0xda2b + rank);
    let mut hits = 0u64;
    for _ in 0..DARTS {
        let x: f64 = rng.gen();
        let y: f64 = rng.gen();
        if x * x + y * y <= 1.0 {
            hits += 1;
        }
    }

    dsm::wait_sem("tally");
    unsafe { ptr::write_volatile(tally, ptr::read_volatile(tally) + hits) };
    dsm::post_sem("tally");

    dsm::barrier();

    if rank == 0 {
        let total = unsafe { ptr::read_volatile(tally) };
        let pi = 4.0 * total as f64 / (DARTS * u64::from(NPROC)) as f64;
        println!("pi is approximately {:.6}", pi);
    }

    dsm::exit();
}
