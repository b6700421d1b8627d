pub mod certgen;
pub mod constants;
pub mod util;
