//! Model-parallel checkpoints: partition discovery, expert layouts and
//! dense-to-MoE upcycling.

pub mod io;
pub mod layout;
pub mod partition;
pub mod upcycle;

pub use io::{StateDict, load_state_dict, read_tracker, save_state_dict};
pub use layout::ExpertLayout;
pub use partition::{Partition, discover_partitions, parallel_sizes};
pub use upcycle::{UpcycleConfig, UpcycleReport, Upcycler, convert_expert_layout};
