pub mod mock_origin_tests;
pub mod readiness_tests;
pub mod supervisor_tests;
