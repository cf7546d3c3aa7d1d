mod backend_csv;
