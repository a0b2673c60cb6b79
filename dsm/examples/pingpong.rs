//! Two processes alternate turns through a single shared integer. Needs a
//! running session daemon (`dsmd`) on this host.

use std::ptr;

const ROUNDS: i32 = 5;

fn main() {
    let base = dsm::init(dsm::Config::new("pingpong", 2, 2, 4096));
    let turn = base as *mut i32;
    let me = dsm::get_gid();

    for _ in 0..ROUNDS {
        while unsafe { ptr::read_volatile(turn) } != me {
            std::hint::spin_loop();
        }

        if me == 0 {
            println!("Ping!");
        } else {
            println!("Pong!");
        }

        unsafe { ptr::write_volatile(turn, 1 - me) };
    }

    dsm::exit();
}
