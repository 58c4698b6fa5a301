// chat-test-utils: Shared test utilities for the chat service suite.
//
// Provides a mock TCP chat client for integration testing of the server:
// raw frame I/O with either codec, plus register/login conveniences for
// scenario tests.

pub mod mock_client;

pub use mock_client::MockChatClient;
