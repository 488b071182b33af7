mod draw_test;
mod helpers;
mod reservation_test;
mod settlement_test;
