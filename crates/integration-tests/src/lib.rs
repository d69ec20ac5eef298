//! Registration of integration tests
//!
//! Tests register themselves with [`integration_test!`] and are collected
//! by the `libtest-mimic` runner in `main.rs`.

use linkme::distributed_slice;

pub type TestFn = fn() -> color_eyre::Result<()>;

/// A single named integration test
#[derive(Debug)]
pub struct IntegrationTest {
    pub name: &'static str,
    pub f: TestFn,
}

impl IntegrationTest {
    pub const fn new(name: &'static str, f: TestFn) -> Self {
        Self { name, f }
    }
}

#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register a `fn() -> color_eyre::Result<()>` as an integration test
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        const _: () = {
            #[::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            static TEST: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn_name), $fn_name);
        };
    };
}
