pub mod mock_quic;
