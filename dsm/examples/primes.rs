//! Four processes count primes below a bound, each over a strided range,
//! accumulating into a shared counter under a named semaphore. The answer
//! for the default bound is 1229. Needs a running session daemon.

use plasma::time::wall_time;
use std::ptr;

const NPROC: u32 = 4;
const LIMIT: u32 = 10_000;

fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }

    let mut div = 3;
    while div * div <= n {
        if n % div == 0 {
            return false;
        }
        div += 2;
    }

    true
}

fn main() {
    let started = wall_time();

    let base = dsm::init(dsm::Config::new("primes", NPROC, NPROC, 4096));
    let sum = base as *mut u32;
    let rank = dsm::get_gid() as u32;

    let mut count = 0;
    let mut n = 2 + rank;
    while n < LIMIT {
        if is_prime(n) {
            count += 1;
        }
        n += NPROC;
    }

    dsm::wait_sem("sum");
    unsafe { ptr::write_volatile(sum, ptr::read_volatile(sum) + count) };
    dsm::post_sem("sum");

    dsm::barrier();

    if rank == 0 {
        let total = unsafe { ptr::read_volatile(sum) };
        println!("primes below {}: {} ({:.3}s)", LIMIT, total, wall_time() - started);
    }

    dsm::exit();
}
