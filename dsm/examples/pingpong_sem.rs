//! Ping-pong driven entirely by named semaphores: each side parks on its
//! own semaphore and posts the other's. Needs a running session daemon.

const ROUNDS: u32 = 5;

fn main() {
    dsm::init(dsm::Config::new("pingpong-sem", 2, 2, 4096));

    // Both semaphores are born with one token. Rank 0 keeps its token and
    // leads; rank 1 drains its own twice and parks until posted.
    if dsm::get_gid() == 0 {
        dsm::wait_sem("turn-zero");
    } else {
        dsm::wait_sem("turn-one");
        dsm::wait_sem("turn-one");
    }

    for _ in 0..ROUNDS {
        if dsm::get_gid() == 0 {
            println!("Ping!");
            dsm::post_sem("turn-one");
            dsm::wait_sem("turn-zero");
        } else {
            println!("Pong!");
            dsm::post_sem("turn-zero");
            dsm::wait_sem("turn-one");
        }
    }

    // Unpark the peer for its final wait so both sides reach the exit
    // barrier.
    if dsm::get_gid() == 0 {
        dsm::post_sem("turn-one");
    } else {
        dsm::post_sem("turn-zero");
    }

    dsm::exit();
}
