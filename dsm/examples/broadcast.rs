//! Hole-assisted bulk transfer: rank 0 stages a buffer inside a hole —
//! every store stays local — then fills the hole, shipping the whole range
//! in one serialized operation. Needs a running session daemon.

use std::ptr;

const WORDS: usize = 256;

fn main() {
    let base = dsm::init(dsm::Config::new("broadcast", 2, 2, 4096));
    let data = base as *mut u32;

    if dsm::get_gid() == 0 {
        let hole = dsm::dig_hole(base, WORDS * 4);
        assert!(hole > 0, "couldn't dig staging hole");

        for i in 0..WORDS {
            unsafe { ptr::write_volatile(data.add(i), (i * 3) as u32) };
        }

        dsm::fill_hole(hole);
    }

    dsm::barrier();

    for i in 0..WORDS {
        let got = unsafe { ptr::read_volatile(data.add(i)) };
        assert_eq!(got, (i * 3) as u32, "divergent copy at word {}", i);
    }

    println!("rank {} verified {} words", dsm::get_gid(), WORDS);
    dsm::exit();
}
