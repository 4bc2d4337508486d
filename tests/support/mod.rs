pub mod mock_loki;
