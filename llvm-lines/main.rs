pub use hydra::*;

#[path = "../src/test.rs"]
mod test;

// This version of the test is a non-#[cfg(test)] binary so that
// cargo llvm-lines can find it. See also ../src/main.rs

pub fn main() {
    test::replicated_write_test();
    test::divergent_write_test();
    test::recovery_test();
}
