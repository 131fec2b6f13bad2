pub mod fake_clock;
pub mod fake_os;
pub mod mock_ws_server;

pub use fake_clock::FakeClock;
pub use fake_os::FakeOs;
pub use mock_ws_server::MockWsServer;
